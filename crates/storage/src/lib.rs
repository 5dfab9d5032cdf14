//! Storage layer for the registrar engine: the event, snapshot, and audit
//! collections over SQLite.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};

pub mod audit_log;
pub mod error;
pub mod event_store;
pub mod snapshot_store;

pub use audit_log::AuditLog;
pub use error::StorageError;
pub use event_store::EventStore;
pub use snapshot_store::SnapshotStore;

/// Create a SQLite connection pool.
///
/// WAL keeps readers off the writer's back; `synchronous=FULL` makes every
/// committed append durable before it is acknowledged.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, StorageError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(StorageError::Connection)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(StorageError::Connection)
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(StorageError::Migration)
}

/// Start a transaction that acquires SQLite's write lock up front.
///
/// Plain `BEGIN` is deferred: it takes no lock until the first write, so two
/// concurrent read-then-write transactions can both start, race to upgrade,
/// and one surfaces as `SQLITE_BUSY`/`SQLITE_BUSY_SNAPSHOT` instead of
/// waiting out `busy_timeout`. `BEGIN IMMEDIATE` takes the write lock at
/// start, so contending writers simply queue behind it.
pub(crate) async fn begin_immediate(
    pool: &SqlitePool,
) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
    let conn = pool.acquire().await?;
    Transaction::begin(conn, Some("BEGIN IMMEDIATE".into())).await
}

/// Check database connectivity.
pub async fn check_connection(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(StorageError::Query)?;
    Ok(())
}
