// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// Traits and value types shared by every aggregate:
// - Aggregate / Snapshot  (state and its persisted bookkeeping)
// - Command               (intent targeting one aggregate)
// - Event / AnyEvent      (facts, typed and erased)
// - Metadata / EventInfo  (immutable context travelling with events)
//
// No domain-specific code lives here.
//
// ============================================================================

pub mod aggregate;
pub mod command;
pub mod event;

pub use aggregate::{Aggregate, Snapshot};
pub use command::{command_name, Command};
pub use event::{
    deserialize, serialize, AnyEvent, Event, EventBuffer, EventInfo, EventRecord, Metadata,
};
