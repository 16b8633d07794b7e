use sqlx::Sqlite;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event_sourcing::core::{deserialize, serialize, Aggregate, Snapshot};

use super::unit_of_work::{ExecutionContext, StatelessView};

// ============================================================================
// Aggregate Store - Snapshot Persistence with Optimistic Concurrency
// ============================================================================
//
// Responsibilities:
// 1. Load the latest snapshot of an aggregate by business id
// 2. Insert a snapshot the first time, handing back the assigned global id
// 3. Update a snapshot only if nobody else moved its event sequence since it
//    was loaded (compare-and-swap on event_sequence)
//
// Conflicts are detected, not prevented: a losing writer gets Conflict and
// nothing it wrote survives, because the whole unit of work rolls back.
//
// ============================================================================

const GET_AGGREGATE_BY_ID: &str = "SELECT global_id, class_name, event_sequence, current_state
     FROM aggregate
     WHERE aggregate_identifier = ?";

const INSERT_STATE: &str = "INSERT INTO aggregate (aggregate_identifier, class_name, event_sequence, current_state)
     VALUES (?, ?, ?, ?)";

const UPDATE_STATE: &str = "UPDATE aggregate
     SET current_state = ?, event_sequence = ?
     WHERE global_id = ? AND event_sequence = ?";

#[derive(Debug, Clone, Default)]
pub struct AggregateStore;

impl AggregateStore {
    pub fn new() -> Self {
        Self
    }

    /// Loads the snapshot through the context's unit of work.
    ///
    /// Absent row → `NotFound`. The returned snapshot has
    /// `initial_event_sequence == event_sequence == stored sequence`.
    pub async fn load<A: Aggregate>(
        &self,
        ctx: &ExecutionContext,
        business_id: Uuid,
    ) -> Result<Snapshot<A>> {
        let mut uow = ctx.current().await?;
        fetch(&mut **uow, business_id).await
    }

    /// Same as [`load`](Self::load) but outside any unit of work.
    pub async fn load_stateless<A: Aggregate>(
        &self,
        view: &StatelessView,
        business_id: Uuid,
    ) -> Result<Snapshot<A>> {
        fetch(view.pool(), business_id).await
    }

    /// Inserts or compare-and-swap updates the snapshot, returning its global id.
    pub async fn save<A: Aggregate>(
        &self,
        ctx: &ExecutionContext,
        snapshot: &Snapshot<A>,
    ) -> Result<i64> {
        let state = serialize(&snapshot.type_name, &snapshot.current_state)?;
        let mut uow = ctx.current().await?;

        match snapshot.global_id {
            Some(global_id) => {
                let result = sqlx::query(UPDATE_STATE)
                    .bind(&state)
                    .bind(snapshot.event_sequence)
                    .bind(global_id)
                    .bind(snapshot.initial_event_sequence)
                    .execute(&mut **uow)
                    .await?;

                // The WHERE clause also pins event_sequence to what we loaded, so
                // no affected rows means another writer got there first.
                if result.rows_affected() == 0 {
                    tracing::warn!(
                        business_id = %snapshot.business_id,
                        global_id,
                        expected_sequence = snapshot.initial_event_sequence,
                        "Optimistic concurrency conflict on aggregate save"
                    );
                    return Err(Error::Conflict {
                        business_id: snapshot.business_id,
                        expected_sequence: snapshot.initial_event_sequence,
                    });
                }

                tracing::debug!(
                    business_id = %snapshot.business_id,
                    global_id,
                    from_sequence = snapshot.initial_event_sequence,
                    to_sequence = snapshot.event_sequence,
                    "Updated aggregate snapshot"
                );
                Ok(global_id)
            }
            None => {
                let result = sqlx::query(INSERT_STATE)
                    .bind(snapshot.business_id)
                    .bind(&snapshot.type_name)
                    .bind(snapshot.event_sequence)
                    .bind(&state)
                    .execute(&mut **uow)
                    .await
                    .map_err(|e| match e {
                        // Created by someone else since we looked.
                        sqlx::Error::Database(ref db) if db.is_unique_violation() => Error::Conflict {
                            business_id: snapshot.business_id,
                            expected_sequence: snapshot.initial_event_sequence,
                        },
                        other => Error::Database(other),
                    })?;

                let global_id = result.last_insert_rowid();
                tracing::debug!(
                    business_id = %snapshot.business_id,
                    global_id,
                    "Inserted aggregate snapshot"
                );
                Ok(global_id)
            }
        }
    }
}

async fn fetch<'e, A, X>(executor: X, business_id: Uuid) -> Result<Snapshot<A>>
where
    A: Aggregate,
    X: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, (i64, String, i64, String)>(GET_AGGREGATE_BY_ID)
        .bind(business_id)
        .fetch_optional(executor)
        .await?;

    let Some((global_id, type_name, event_sequence, state)) = row else {
        return Err(Error::NotFound { business_id });
    };

    if type_name != A::TYPE_NAME {
        return Err(Error::serialization(
            A::TYPE_NAME,
            format!("aggregate {business_id} is stored as {type_name}"),
        ));
    }

    let current_state: Option<A> = deserialize(&type_name, &state)?;
    if current_state.is_none() {
        return Err(Error::serialization(
            type_name,
            format!("aggregate {business_id} has no state"),
        ));
    }

    Ok(Snapshot {
        global_id: Some(global_id),
        business_id,
        type_name,
        current_state,
        initial_event_sequence: event_sequence,
        event_sequence,
    })
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::store::Database;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Ledger {
        entries: Vec<String>,
    }

    impl Aggregate for Ledger {
        const TYPE_NAME: &'static str = "Ledger";
    }

    #[derive(Serialize, Deserialize, Debug)]
    struct Other;

    impl Aggregate for Other {
        const TYPE_NAME: &'static str = "Other";
    }

    async fn database() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn ledger(entries: &[&str]) -> Ledger {
        Ledger {
            entries: entries.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn insert(db: &Database, id: Uuid, sequence: i64) -> i64 {
        let store = AggregateStore::new();
        let ctx = db.context();
        ctx.acquire().await.unwrap();

        let mut snapshot = Snapshot::new(id);
        snapshot.current_state = Some(ledger(&["opened"]));
        snapshot.event_sequence = sequence;
        let global_id = store.save(&ctx, &snapshot).await.unwrap();

        ctx.commit().await.unwrap();
        global_id
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let db = database().await;
        let ctx = db.context();
        ctx.acquire().await.unwrap();

        let id = Uuid::new_v4();
        let result = AggregateStore::new().load::<Ledger>(&ctx, id).await;
        assert!(matches!(result, Err(Error::NotFound { business_id }) if business_id == id));
    }

    #[tokio::test]
    async fn test_insert_then_load_round_trips_state() {
        let db = database().await;
        let id = Uuid::new_v4();
        let global_id = insert(&db, id, 3).await;

        let snapshot = AggregateStore::new()
            .load_stateless::<Ledger>(&db.stateless_view(), id)
            .await
            .unwrap();

        assert_eq!(snapshot.global_id, Some(global_id));
        assert_eq!(snapshot.type_name, "Ledger");
        assert_eq!(snapshot.initial_event_sequence, 3);
        assert_eq!(snapshot.event_sequence, 3);
        assert_eq!(snapshot.current_state, Some(ledger(&["opened"])));
    }

    #[tokio::test]
    async fn test_update_with_matching_sequence_succeeds() {
        let db = database().await;
        let store = AggregateStore::new();
        let id = Uuid::new_v4();
        insert(&db, id, 1).await;

        let ctx = db.context();
        ctx.acquire().await.unwrap();
        let mut snapshot = store.load::<Ledger>(&ctx, id).await.unwrap();
        snapshot.current_state = Some(ledger(&["opened", "credited"]));
        snapshot.advance_to(2);
        store.save(&ctx, &snapshot).await.unwrap();
        ctx.commit().await.unwrap();

        let reloaded = store
            .load_stateless::<Ledger>(&db.stateless_view(), id)
            .await
            .unwrap();
        assert_eq!(reloaded.initial_event_sequence, 2);
        assert_eq!(reloaded.current_state, Some(ledger(&["opened", "credited"])));
    }

    #[tokio::test]
    async fn test_stale_sequence_conflicts_and_writes_nothing() {
        let db = database().await;
        let store = AggregateStore::new();
        let id = Uuid::new_v4();
        let global_id = insert(&db, id, 5).await;

        let ctx = db.context();
        ctx.acquire().await.unwrap();
        let stale = Snapshot {
            global_id: Some(global_id),
            business_id: id,
            type_name: "Ledger".to_string(),
            current_state: Some(ledger(&["overwritten"])),
            initial_event_sequence: 4,
            event_sequence: 6,
        };

        let result = store.save(&ctx, &stale).await;
        assert!(matches!(
            result,
            Err(Error::Conflict { business_id, expected_sequence: 4 }) if business_id == id
        ));
        ctx.rollback().await.unwrap();

        let stored = store
            .load_stateless::<Ledger>(&db.stateless_view(), id)
            .await
            .unwrap();
        assert_eq!(stored.event_sequence, 5);
        assert_eq!(stored.current_state, Some(ledger(&["opened"])));
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_a_conflict() {
        let db = database().await;
        let store = AggregateStore::new();
        let id = Uuid::new_v4();
        insert(&db, id, 1).await;

        let ctx = db.context();
        ctx.acquire().await.unwrap();
        let fresh = Snapshot::<Ledger>::new(id);

        assert!(matches!(store.save(&ctx, &fresh).await, Err(Error::Conflict { .. })));
        ctx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_with_wrong_type_is_serialization_error() {
        let db = database().await;
        let id = Uuid::new_v4();
        insert(&db, id, 1).await;

        let result = AggregateStore::new()
            .load_stateless::<Other>(&db.stateless_view(), id)
            .await;
        assert!(matches!(result, Err(Error::Serialization { .. })));
    }
}
