// ============================================================================
// Event Sourcing Store - Persistence Layer
// ============================================================================
//
// Relational persistence for any aggregate/event type:
// - Database / ExecutionContext / StatelessView  (unit-of-work plumbing)
// - AggregateStore                               (snapshots, optimistic CAS)
// - EventStore                                   (append-only event log)
//
// ============================================================================

pub mod aggregate_store;
pub mod event_store;
pub mod schema;
pub mod unit_of_work;

pub use aggregate_store::AggregateStore;
pub use event_store::EventStore;
pub use unit_of_work::{Database, ExecutionContext, StatelessView, UnitOfWork};
