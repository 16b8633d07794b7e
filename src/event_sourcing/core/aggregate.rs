use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// Aggregate - Consistency Boundary
// ============================================================================
//
// Key Principles:
// 1. The current state is stored as a snapshot next to the event log
// 2. A snapshot is materialized fresh for every command, never cached
// 3. Commands mutate it in memory only; it is persisted once at command end
// 4. Concurrent writers are detected with a compare-and-swap on the event
//    sequence observed at load time
//
// ============================================================================

/// Implemented by every aggregate state type.
///
/// `TYPE_NAME` is stored in the `class_name` column and checked on load.
pub trait Aggregate: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

/// An aggregate's persisted row plus the bookkeeping needed for the
/// optimistic-concurrency save.
///
/// `global_id` is `None` until the first insert assigns it, and never changes
/// afterwards. `event_sequence >= initial_event_sequence` always holds.
#[derive(Debug, Clone)]
pub struct Snapshot<A> {
    pub global_id: Option<i64>,
    pub business_id: Uuid,
    pub type_name: String,
    pub current_state: Option<A>,
    pub initial_event_sequence: i64,
    pub event_sequence: i64,
}

impl<A: Aggregate> Snapshot<A> {
    /// A snapshot that has never been persisted.
    pub fn new(business_id: Uuid) -> Self {
        Self {
            global_id: None,
            business_id,
            type_name: A::TYPE_NAME.to_string(),
            current_state: None,
            initial_event_sequence: 0,
            event_sequence: 0,
        }
    }

    pub fn exists(&self) -> bool {
        self.global_id.is_some()
    }

    /// Moves the sequence forward after events were appended.
    pub fn advance_to(&mut self, sequence: i64) {
        debug_assert!(sequence >= self.initial_event_sequence);
        self.event_sequence = sequence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, Default)]
    struct Counter {
        value: u32,
    }

    impl Aggregate for Counter {
        const TYPE_NAME: &'static str = "Counter";
    }

    #[test]
    fn test_new_snapshot_is_unpersisted() {
        let id = Uuid::new_v4();
        let snapshot = Snapshot::<Counter>::new(id);

        assert!(!snapshot.exists());
        assert_eq!(snapshot.business_id, id);
        assert_eq!(snapshot.type_name, "Counter");
        assert_eq!(snapshot.initial_event_sequence, 0);
        assert_eq!(snapshot.event_sequence, 0);
        assert!(snapshot.current_state.is_none());
    }

    #[test]
    fn test_advance_keeps_initial_sequence() {
        let mut snapshot = Snapshot::<Counter>::new(Uuid::new_v4());
        snapshot.initial_event_sequence = 4;
        snapshot.event_sequence = 4;

        snapshot.advance_to(9);

        assert_eq!(snapshot.initial_event_sequence, 4);
        assert_eq!(snapshot.event_sequence, 9);
    }
}
