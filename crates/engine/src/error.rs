//! Engine errors.
//!
//! Policy denials are not errors; they travel inside `Decision`. This type
//! covers authorization failures and infrastructure faults.

use thiserror::Error;
use uuid::Uuid;

use registrar_domain::AggregateError;
use registrar_storage::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("actor {actor} may not act for student {student}")]
    Forbidden { actor: Uuid, student: Uuid },

    #[error("enrollment {0} does not exist")]
    UnknownEnrollment(Uuid),

    /// Event-store failure other than a version conflict. The append is the
    /// commit point, so no partial state is visible to callers.
    #[error("event store failure")]
    Store(#[from] StorageError),

    /// A stored stream or snapshot failed to replay. Surfaced, never papered
    /// over: replay feeds every admission decision.
    #[error("replay failure")]
    Replay(#[from] AggregateError),

    #[error("coordinator failure: {0}")]
    Internal(String),
}
