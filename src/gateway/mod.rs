// ============================================================================
// Gateways - Entry Points for Commands and Queries
// ============================================================================

pub mod command;
pub mod locks;
pub mod query;

pub use command::{AppendedEvent, CommandGateway, CommandReceipt};
pub use locks::{CriticalSection, CriticalSections};
pub use query::QueryGateway;
