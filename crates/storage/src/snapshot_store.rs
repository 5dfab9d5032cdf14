//! Aggregate snapshot persistence.

use chrono::Utc;
use sqlx::SqlitePool;

use registrar_domain::Snapshot;

use crate::StorageError;

#[derive(Debug, Clone, sqlx::FromRow)]
struct SnapshotRow {
    stream_id: String,
    version: i64,
    state: String,
    created_at: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot, StorageError> {
        let state = serde_json::from_str(&self.state).map_err(|e| {
            StorageError::Corrupt(format!("snapshot {}@{}: {e}", self.stream_id, self.version))
        })?;
        let created_at = crate::event_store::parse_timestamp(&self.created_at)?;
        Ok(Snapshot {
            stream_id: self.stream_id,
            version: self.version as u64,
            state,
            created_at,
        })
    }
}

/// Snapshot repository.
#[derive(Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist the aggregate state at `version`. Re-saving the same version
    /// overwrites; snapshots are a replay shortcut, not a source of truth.
    pub async fn save(
        &self,
        stream_id: &str,
        version: u64,
        state: &serde_json::Value,
    ) -> Result<(), StorageError> {
        let state_json =
            serde_json::to_string(state).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        sqlx::query(
            "INSERT INTO snapshots (stream_id, version, state, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (stream_id, version) DO UPDATE SET \
                 state = EXCLUDED.state, \
                 created_at = EXCLUDED.created_at",
        )
        .bind(stream_id)
        .bind(version as i64)
        .bind(state_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Query)?;
        Ok(())
    }

    /// Most recent snapshot for a stream, if any.
    pub async fn latest(&self, stream_id: &str) -> Result<Option<Snapshot>, StorageError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            "SELECT stream_id, version, state, created_at FROM snapshots \
             WHERE stream_id = ?1 ORDER BY version DESC LIMIT 1",
        )
        .bind(stream_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }
}
