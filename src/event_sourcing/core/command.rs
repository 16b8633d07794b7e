use uuid::Uuid;

use super::aggregate::Aggregate;

// ============================================================================
// Commands
// ============================================================================

/// An intent to change exactly one aggregate.
///
/// The gateway serializes commands per target id, so the id must be known
/// before anything else happens. Returning `None` rejects the command with
/// `NoTargetIdentifier` before any side effect.
pub trait Command: Send + 'static {
    type Aggregate: Aggregate;

    fn target_aggregate_id(&self) -> Option<Uuid>;
}

/// Unqualified type name of a command, as used in logs, metrics and errors.
pub fn command_name<C: Command>() -> &'static str {
    let full = std::any::type_name::<C>();
    full.rsplit("::").next().unwrap_or(full)
}
