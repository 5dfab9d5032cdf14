//! The registrar enrollment engine: lock manager, campus directory,
//! enrollment coordinator, and invariant monitor.

pub mod coordinator;
pub mod directory;
pub mod error;
pub mod lock;
pub mod monitor;

pub use coordinator::{EngineConfig, EnrollmentEngine, SYSTEM_ACTOR};
pub use directory::{CampusDirectory, DirectoryError, InMemoryDirectory};
pub use error::EngineError;
pub use lock::{Acquisition, LockError, LockManager};
pub use monitor::{InvariantKind, InvariantReport, InvariantViolation};
