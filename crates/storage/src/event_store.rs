//! Append-only event store with per-stream optimistic concurrency.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use registrar_domain::{EventEnvelope, EventPayload};

use crate::StorageError;

/// Event record from database. Timestamps are stored as RFC3339 text so a
/// read-back envelope is bit-identical to the one that was appended.
#[derive(Debug, Clone, sqlx::FromRow)]
struct EventRow {
    event_id: String,
    stream_id: String,
    stream_version: i64,
    occurred_at: String,
    causation_id: String,
    payload: String,
}

impl EventRow {
    fn into_envelope(self) -> Result<EventEnvelope, StorageError> {
        let event_id = parse_uuid(&self.event_id)?;
        let causation_id = parse_uuid(&self.causation_id)?;
        let occurred_at = parse_timestamp(&self.occurred_at)?;
        let payload: EventPayload = serde_json::from_str(&self.payload)
            .map_err(|e| StorageError::Corrupt(format!("event {event_id} payload: {e}")))?;
        Ok(EventEnvelope {
            event_id,
            stream_id: self.stream_id,
            stream_version: self.stream_version as u64,
            occurred_at,
            causation_id,
            payload,
        })
    }
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::Corrupt(format!("not a uuid: {raw}")))
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::Corrupt(format!("not an RFC3339 timestamp: {raw}")))
}

const SELECT_EVENT: &str = "SELECT event_id, stream_id, stream_version, occurred_at, \
     causation_id, event_type, payload FROM events";

/// Event store repository.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one event at `expected_version + 1`.
    ///
    /// The commit runs in a transaction that re-reads the stream head, and
    /// the unique `(stream_id, stream_version)` index backs the same check,
    /// so a losing racer surfaces as [`StorageError::VersionConflict`]
    /// whichever way the race falls. The transaction is committed (and with
    /// `synchronous=FULL`, on disk) before the envelope is returned.
    pub async fn append(
        &self,
        stream_id: &str,
        expected_version: u64,
        causation_id: Uuid,
        payload: &EventPayload,
    ) -> Result<EventEnvelope, StorageError> {
        let mut tx = crate::begin_immediate(&self.pool).await.map_err(StorageError::Query)?;

        let current: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(stream_version), 0) FROM events WHERE stream_id = ?1",
        )
        .bind(stream_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StorageError::Query)?;

        if current as u64 != expected_version {
            return Err(StorageError::VersionConflict {
                stream_id: stream_id.to_string(),
                expected: expected_version,
                current: current as u64,
            });
        }

        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            stream_id: stream_id.to_string(),
            stream_version: expected_version + 1,
            occurred_at: Utc::now(),
            causation_id,
            payload: payload.clone(),
        };

        let payload_json = serde_json::to_string(&envelope.payload)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let inserted = sqlx::query(
            "INSERT INTO events \
             (event_id, stream_id, stream_version, occurred_at, causation_id, event_type, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(envelope.event_id.to_string())
        .bind(stream_id)
        .bind(envelope.stream_version as i64)
        .bind(envelope.occurred_at.to_rfc3339())
        .bind(envelope.causation_id.to_string())
        .bind(envelope.payload.kind())
        .bind(payload_json)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(StorageError::Query)?;
                Ok(envelope)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // Lost the insert race; report where the stream actually is.
                drop(tx);
                let current = self.current_version(stream_id).await?;
                Err(StorageError::VersionConflict {
                    stream_id: stream_id.to_string(),
                    expected: expected_version,
                    current,
                })
            }
            Err(e) => Err(StorageError::Query(e)),
        }
    }

    /// Events of one stream in version order, restricted to versions
    /// strictly greater than `after_version` when given.
    pub async fn load(
        &self,
        stream_id: &str,
        after_version: Option<u64>,
    ) -> Result<Vec<EventEnvelope>, StorageError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENT} WHERE stream_id = ?1 AND stream_version > ?2 \
             ORDER BY stream_version"
        ))
        .bind(stream_id)
        .bind(after_version.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        rows.into_iter().map(EventRow::into_envelope).collect()
    }

    /// Current head version of a stream; 0 when the stream has no events.
    pub async fn current_version(&self, stream_id: &str) -> Result<u64, StorageError> {
        let current: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(stream_version), 0) FROM events WHERE stream_id = ?1",
        )
        .bind(stream_id)
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Query)?;
        Ok(current as u64)
    }

    /// All events produced on behalf of one request, in append order. The
    /// idempotency check for resubmitted requests.
    pub async fn find_by_causation(
        &self,
        causation_id: Uuid,
    ) -> Result<Vec<EventEnvelope>, StorageError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENT} WHERE causation_id = ?1 ORDER BY rowid"
        ))
        .bind(causation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        rows.into_iter().map(EventRow::into_envelope).collect()
    }

    /// The event that created an enrollment, if any.
    pub async fn find_enrollment_event(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Option<EventEnvelope>, StorageError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "{SELECT_EVENT} WHERE event_type IN ('enrolled', 'promoted') \
             AND json_extract(payload, '$.payload.enrollment_id') = ?1 \
             ORDER BY rowid LIMIT 1"
        ))
        .bind(enrollment_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Query)?;

        row.map(EventRow::into_envelope).transpose()
    }

    /// Distinct stream ids starting with `prefix`, sorted.
    pub async fn list_streams(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT stream_id FROM events WHERE stream_id LIKE ?1 ORDER BY stream_id",
        )
        .bind(format!("{prefix}%"))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Query)?;
        Ok(rows)
    }
}
