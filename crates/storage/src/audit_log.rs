//! Persistence for the hash-chained audit log.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use registrar_domain::{AuditAction, AuditEntry};

use crate::StorageError;

/// Concurrent decisions race for the next seq; the primary key settles the
/// race and the loser re-reads the head and tries again.
const APPEND_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, sqlx::FromRow)]
struct AuditRow {
    seq: i64,
    ts: String,
    actor_id: String,
    action: String,
    resource: String,
    before_state: Option<String>,
    after_state: Option<String>,
    event_ids: String,
    previous_hash: String,
    entry_hash: String,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditEntry, StorageError> {
        let action = match self.action.as_str() {
            "ENROLL" => AuditAction::Enroll,
            "DROP" => AuditAction::Drop,
            "WAITLIST" => AuditAction::Waitlist,
            "PROMOTE" => AuditAction::Promote,
            "REJECT" => AuditAction::Reject,
            "CANCEL" => AuditAction::Cancel,
            other => {
                return Err(StorageError::Corrupt(format!(
                    "unknown audit action: {other}"
                )));
            }
        };
        let event_ids: Vec<Uuid> = serde_json::from_str(&self.event_ids)
            .map_err(|e| StorageError::Corrupt(format!("audit entry {}: {e}", self.seq)))?;
        let timestamp = crate::event_store::parse_timestamp(&self.ts)?;
        Ok(AuditEntry {
            seq: self.seq as u64,
            timestamp,
            actor_id: self.actor_id,
            action,
            resource: self.resource,
            before: parse_opt_json(self.before_state, self.seq)?,
            after: parse_opt_json(self.after_state, self.seq)?,
            event_ids,
            previous_hash: self.previous_hash,
            entry_hash: self.entry_hash,
        })
    }
}

fn parse_opt_json(
    raw: Option<String>,
    seq: i64,
) -> Result<Option<serde_json::Value>, StorageError> {
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| StorageError::Corrupt(format!("audit entry {seq}: {e}")))
    })
    .transpose()
}

/// Audit log repository.
#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one entry, chaining it to the current head.
    pub async fn append(
        &self,
        actor_id: &str,
        action: AuditAction,
        resource: &str,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        event_ids: Vec<Uuid>,
    ) -> Result<AuditEntry, StorageError> {
        let mut last_err = None;
        for _ in 0..APPEND_ATTEMPTS {
            match self
                .try_append(actor_id, action, resource, &before, &after, &event_ids)
                .await
            {
                Ok(entry) => return Ok(entry),
                Err(StorageError::Query(sqlx::Error::Database(db)))
                    if db.is_unique_violation() =>
                {
                    last_err = Some(StorageError::Query(sqlx::Error::Database(db)));
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            StorageError::Corrupt("audit append retries exhausted".to_string())
        }))
    }

    async fn try_append(
        &self,
        actor_id: &str,
        action: AuditAction,
        resource: &str,
        before: &Option<serde_json::Value>,
        after: &Option<serde_json::Value>,
        event_ids: &[Uuid],
    ) -> Result<AuditEntry, StorageError> {
        let mut tx = crate::begin_immediate(&self.pool).await.map_err(StorageError::Query)?;

        let head: Option<(i64, String)> = sqlx::query_as(
            "SELECT seq, entry_hash FROM audit_log ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::Query)?;

        let entry = AuditEntry::chained(
            head.as_ref().map(|(seq, hash)| (*seq as u64, hash.as_str())),
            Utc::now(),
            actor_id.to_string(),
            action,
            resource.to_string(),
            before.clone(),
            after.clone(),
            event_ids.to_vec(),
        );

        let event_ids_json = serde_json::to_string(&entry.event_ids)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        sqlx::query(
            "INSERT INTO audit_log \
             (seq, ts, actor_id, action, resource, before_state, after_state, \
              event_ids, previous_hash, entry_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(entry.seq as i64)
        .bind(entry.timestamp.to_rfc3339())
        .bind(&entry.actor_id)
        .bind(entry.action.as_str())
        .bind(&entry.resource)
        .bind(entry.before.as_ref().map(|v| v.to_string()))
        .bind(entry.after.as_ref().map(|v| v.to_string()))
        .bind(event_ids_json)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::Query)?;

        tx.commit().await.map_err(StorageError::Query)?;
        Ok(entry)
    }

    /// All entries, oldest first.
    pub async fn entries(&self) -> Result<Vec<AuditEntry>, StorageError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT seq, ts, actor_id, action, resource, before_state, after_state, \
             event_ids, previous_hash, entry_hash FROM audit_log ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        rows.into_iter().map(AuditRow::into_entry).collect()
    }

    pub async fn len(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Query)?;
        Ok(count as u64)
    }
}
