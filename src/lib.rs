// ============================================================================
// ddd_engine - CQRS / Event Sourcing Engine
// ============================================================================
//
// Write path: CommandGateway -> HandlerRegistry -> AggregateStore/EventStore,
// all inside one unit of work per command.
// Read path: QueryGateway over a StatelessView, and EventStream redelivering
// stored events from the broker to processing groups.
//
// ============================================================================

pub mod config;
pub mod domain;
pub mod error;
pub mod event_sourcing;
pub mod gateway;
pub mod messaging;
pub mod metrics;
pub mod wiring;

pub use config::{EngineConfig, StreamConfig};
pub use error::{Error, Result};
