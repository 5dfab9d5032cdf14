//! Storage errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(#[source] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("Query error: {0}")]
    Query(#[source] sqlx::Error),

    /// Optimistic concurrency check failed: the stream moved past the
    /// caller's expected version.
    #[error("version conflict on {stream_id}: expected {expected}, stream is at {current}")]
    VersionConflict {
        stream_id: String,
        expected: u64,
        current: u64,
    },

    #[error("Stored record is not readable: {0}")]
    Corrupt(String),
}

impl StorageError {
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StorageError::VersionConflict { .. })
    }
}
