use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::event_sourcing::{Database, EventInfo, ExecutionContext, StatelessView};
use super::events::{DriverNameAmended, DriverRegistered};

// ============================================================================
// Driver Read Model
// ============================================================================
//
// The `driver` table is written by domain-event handlers, inside the same
// unit of work as the command, so it is always consistent with the event
// log. Queries read it through the stateless view.
//
// The stream handlers only log: they show the asynchronous path.
//
// ============================================================================

pub const GET_DRIVER_BY_ID: &str = "GET_DRIVER_BY_ID";

const CREATE_DRIVER_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS driver (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    driver_id     BLOB    NOT NULL UNIQUE,
    name          TEXT    NOT NULL,
    date_of_birth TEXT    NOT NULL
)
"#;

const INSERT_DRIVER: &str =
    "INSERT INTO driver (driver_id, name, date_of_birth) VALUES (?, ?, ?)";

const AMEND_DRIVER_NAME: &str = "UPDATE driver SET name = ? WHERE driver_id = ?";

const SELECT_DRIVER: &str =
    "SELECT driver_id, name, date_of_birth FROM driver WHERE driver_id = ?";

/// Query result for [`GET_DRIVER_BY_ID`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverView {
    pub driver_id: Uuid,
    pub name: String,
    pub date_of_birth: NaiveDate,
}

pub async fn migrate(database: &Database) -> Result<()> {
    sqlx::query(CREATE_DRIVER_TABLE)
        .execute(database.pool())
        .await?;
    Ok(())
}

// ============================================================================
// Domain Event Handlers
// ============================================================================

pub async fn project_registered(event: DriverRegistered, ctx: ExecutionContext) -> anyhow::Result<()> {
    tracing::info!(driver_id = %event.driver_id, name = %event.name, "Driver registered");

    let mut uow = ctx.current().await?;
    sqlx::query(INSERT_DRIVER)
        .bind(event.driver_id)
        .bind(&event.name)
        .bind(event.date_of_birth)
        .execute(&mut **uow)
        .await?;
    Ok(())
}

pub async fn project_name_amended(event: DriverNameAmended, ctx: ExecutionContext) -> anyhow::Result<()> {
    tracing::info!(driver_id = %event.driver_id, name = %event.name, "Driver name amended");

    let mut uow = ctx.current().await?;
    let result = sqlx::query(AMEND_DRIVER_NAME)
        .bind(&event.name)
        .bind(event.driver_id)
        .execute(&mut **uow)
        .await?;

    anyhow::ensure!(
        result.rows_affected() == 1,
        "driver {} missing from read model",
        event.driver_id
    );
    Ok(())
}

// ============================================================================
// Query Handlers
// ============================================================================

pub async fn driver_by_id(driver_id: Uuid, view: StatelessView) -> anyhow::Result<Option<DriverView>> {
    let row = sqlx::query_as::<_, (Uuid, String, NaiveDate)>(SELECT_DRIVER)
        .bind(driver_id)
        .fetch_optional(view.pool())
        .await?;

    Ok(row.map(|(driver_id, name, date_of_birth)| DriverView {
        driver_id,
        name,
        date_of_birth,
    }))
}

// ============================================================================
// Stream Event Handlers
// ============================================================================

pub async fn stream_registered(event: DriverRegistered, info: EventInfo) -> anyhow::Result<()> {
    tracing::info!(
        global_sequence = ?info.global_sequence,
        driver_id = %event.driver_id,
        "📨 Streamed DriverRegistered"
    );
    Ok(())
}

pub async fn stream_name_amended(event: DriverNameAmended, info: EventInfo) -> anyhow::Result<()> {
    tracing::info!(
        global_sequence = ?info.global_sequence,
        driver_id = %event.driver_id,
        name = %event.name,
        "📨 Streamed DriverNameAmended"
    );
    Ok(())
}
