use sqlx::sqlite::SqlitePool;

use crate::error::Result;

// ============================================================================
// Event Store Schema
// ============================================================================
//
// aggregate: one snapshot row per business id
//   - global_id            storage-assigned, never reused (AUTOINCREMENT)
//   - aggregate_identifier business id, unique
//   - event_sequence       global sequence of the last event applied
//
// event: append-only log
//   - global_sequence      strictly increasing, never reused; gaps are allowed
//                          where a unit of work was rolled back
//
// ============================================================================

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS aggregate (
        global_id            INTEGER PRIMARY KEY AUTOINCREMENT,
        aggregate_identifier BLOB    NOT NULL UNIQUE,
        class_name           TEXT    NOT NULL,
        event_sequence       INTEGER NOT NULL,
        current_state        TEXT    NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS event (
        global_sequence     INTEGER PRIMARY KEY AUTOINCREMENT,
        aggregate_global_id INTEGER NOT NULL REFERENCES aggregate (global_id),
        class_name          TEXT    NOT NULL,
        payload             TEXT    NOT NULL,
        metadata            TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS event_aggregate_global_id_idx ON event (aggregate_global_id)",
];

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(*statement).execute(pool).await?;
    }

    tracing::debug!("Event store schema is up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::store::Database;

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::in_memory().await.unwrap();

        migrate(db.pool()).await.unwrap();
        migrate(db.pool()).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('aggregate', 'event') ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();

        assert_eq!(tables, vec!["aggregate".to_string(), "event".to_string()]);
    }
}
