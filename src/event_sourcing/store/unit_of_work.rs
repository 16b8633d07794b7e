use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};

use crate::error::{Error, Result};

use super::schema;

// ============================================================================
// Unit of Work
// ============================================================================
//
// One command = one database transaction = one connection.
//
// The transaction is not ambient: it lives in an ExecutionContext, an explicit
// per-caller scope that is handed to the gateway and to every collaborator
// that needs the connection (stores, domain-event handlers).
//
// States of the slot inside a context:
//   unbound --acquire--> active --commit/rollback--> unbound
//
// Nesting is refused: acquire() on an active context fails.
//
// SQLite allows one writer at a time. Units of work begin IMMEDIATE, so two
// commands for different aggregates serialize on the database lock (waiting
// up to BUSY_TIMEOUT) rather than failing with "database is locked".
//
// ============================================================================

/// How long a writer waits for another unit of work to release the database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the connection pool.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        if url.contains(":memory:") {
            tracing::info!("Using a private in-memory event store database");
            return Self::in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        tracing::info!(url = %url, max_connections, "Connected to event store database");
        Ok(Self { pool })
    }

    /// Private in-memory database on a single pinned connection.
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool
    /// must never open a second one or drop the first.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        schema::migrate(&self.pool).await
    }

    /// A fresh scope with no unit of work bound to it.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext {
            pool: self.pool.clone(),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Auto-commit read access, usable without any unit of work.
    pub fn stateless_view(&self) -> StatelessView {
        StatelessView {
            pool: self.pool.clone(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

type Slot = Option<Transaction<'static, Sqlite>>;

/// The bound transaction, locked out of its context.
///
/// Owns its lock, so it can be held across awaits inside spawned or boxed
/// futures. Derefs to the transaction, which derefs to the connection:
/// `query.execute(&mut **uow)`.
pub type UnitOfWork = OwnedMappedMutexGuard<Slot, Transaction<'static, Sqlite>>;

/// Per-caller scope holding at most one active unit of work.
///
/// Cloning yields another handle to the same scope; that is how a domain-event
/// handler reaches the command's transaction.
#[derive(Clone)]
pub struct ExecutionContext {
    pool: SqlitePool,
    slot: Arc<Mutex<Slot>>,
}

impl ExecutionContext {
    /// Binds a new connection/transaction to this context.
    pub async fn acquire(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            return Err(Error::UnitOfWorkActive);
        }

        // IMMEDIATE takes the write lock up front, so concurrent units of work
        // queue on the busy timeout instead of deadlocking on lock upgrade.
        *slot = Some(self.pool.begin_with("BEGIN IMMEDIATE").await?);
        tracing::debug!("Unit of work started");
        Ok(())
    }

    /// The active unit of work. Hold it only for the duration of one store
    /// call: handlers invoked in between need to lock it too.
    pub async fn current(&self) -> Result<UnitOfWork> {
        OwnedMutexGuard::try_map(self.slot.clone().lock_owned().await, Option::as_mut)
            .map_err(|_| Error::NoUnitOfWork)
    }

    pub async fn is_active(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Commits and unbinds. If the commit fails the transaction is dropped,
    /// which rolls it back, and the commit error is returned.
    pub async fn commit(&self) -> Result<()> {
        let tx = self.slot.lock().await.take().ok_or(Error::NoUnitOfWork)?;

        match tx.commit().await {
            Ok(()) => {
                tracing::debug!("Unit of work committed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Unit of work commit failed, rolled back");
                Err(e.into())
            }
        }
    }

    /// Rolls back and unbinds.
    pub async fn rollback(&self) -> Result<()> {
        let tx = self.slot.lock().await.take().ok_or(Error::NoUnitOfWork)?;
        tx.rollback().await?;
        tracing::debug!("Unit of work rolled back");
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

/// Read-only, auto-commit access for query handlers and read models.
#[derive(Clone, Debug)]
pub struct StatelessView {
    pool: SqlitePool,
}

impl StatelessView {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
