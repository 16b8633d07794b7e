use crate::error::Result;
use crate::event_sourcing::core::{deserialize, serialize, AnyEvent, EventRecord, Metadata};

use super::unit_of_work::{ExecutionContext, StatelessView};

// ============================================================================
// Event Store - Append-Only Log
// ============================================================================
//
// Responsibilities:
// 1. Append one event to the `event` table inside the caller's unit of work
// 2. Hand back the global sequence the storage assigned to it
// 3. Read an aggregate's history back in global-sequence order
//
// Events are never updated or deleted. Sequences come from AUTOINCREMENT, so
// no committed sequence is ever handed out twice.
//
// The same table is what the CDC connector tails to feed the event stream.
//
// ============================================================================

const INSERT_EVENT: &str = "INSERT INTO event (aggregate_global_id, class_name, payload, metadata)
     VALUES (?, ?, ?, ?)";

const EVENTS_FOR_AGGREGATE: &str = "SELECT global_sequence, aggregate_global_id, class_name, payload, metadata
     FROM event
     WHERE aggregate_global_id = ?
     ORDER BY global_sequence";

#[derive(Debug, Clone, Default)]
pub struct EventStore;

impl EventStore {
    pub fn new() -> Self {
        Self
    }

    /// Appends `event` for the aggregate and returns its global sequence.
    ///
    /// The aggregate row must already exist in this unit of work.
    pub async fn append(
        &self,
        ctx: &ExecutionContext,
        aggregate_global_id: i64,
        event: &dyn AnyEvent,
        metadata: &Metadata,
    ) -> Result<i64> {
        let payload = event.to_payload()?;
        let metadata = serialize("metadata", metadata)?;

        let mut uow = ctx.current().await?;
        let result = sqlx::query(INSERT_EVENT)
            .bind(aggregate_global_id)
            .bind(event.type_name())
            .bind(&payload)
            .bind(&metadata)
            .execute(&mut **uow)
            .await?;

        let global_sequence = result.last_insert_rowid();
        tracing::debug!(
            event_type = event.type_name(),
            aggregate_global_id,
            global_sequence,
            "Appended event"
        );
        Ok(global_sequence)
    }

    /// Committed history of one aggregate, oldest first.
    pub async fn events_for_aggregate(
        &self,
        view: &StatelessView,
        aggregate_global_id: i64,
    ) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query_as::<_, (i64, i64, String, String, String)>(EVENTS_FOR_AGGREGATE)
            .bind(aggregate_global_id)
            .fetch_all(view.pool())
            .await?;

        rows.into_iter()
            .map(|(global_sequence, aggregate_global_id, type_name, payload, metadata)| {
                Ok(EventRecord {
                    global_sequence,
                    aggregate_global_id,
                    metadata: deserialize(&type_name, &metadata)?,
                    type_name,
                    payload,
                })
            })
            .collect()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
