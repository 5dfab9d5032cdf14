//! Domain types for the registrar enrollment engine.

pub mod aggregate;
pub mod audit;
pub mod auth;
pub mod catalog;
pub mod enrollment;
pub mod errors;
pub mod events;
pub mod policy;
pub mod requests;
pub mod schedule;

pub use aggregate::{
    ActiveEnrollment, AggregateError, PastEnrollment, SectionAggregate, Snapshot,
    StudentAggregate, WaitlistEntry,
};
pub use audit::{AuditAction, AuditEntry, ChainViolation, GENESIS_HASH, verify_chain};
pub use auth::{Actor, Claims, UserType};
pub use catalog::{Section, Standing, StudentProfile};
pub use enrollment::{Decision, DenyCode, EnrollmentRequest, EnrollmentStatus, Verdict};
pub use errors::{DomainError, ErrorResponse};
pub use events::{
    EventEnvelope, EventPayload, SECTION_STREAM_PREFIX, STUDENT_STREAM_PREFIX, section_id_of,
    section_stream, student_id_of, student_stream,
};
pub use policy::{
    Caveat, EngineVerdict, Policy, PolicyCheck, PolicyEngine, PolicyEnv, PolicyInput,
    PolicyResult,
};
pub use requests::{
    CancelWaitlistBody, DecisionResponse, DeniedResponse, DropEnrollmentBody,
    EnrollmentsResponse, EnrollmentView, HealthResponse, HistoryView, ReadyResponse,
    SubmitEnrollmentBody, WaitlistView,
};
pub use schedule::{DayOfWeek, MINUTES_PER_DAY, ScheduleError, TimeSlot, any_overlap};
