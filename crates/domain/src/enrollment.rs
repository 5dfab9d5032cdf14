//! Enrollment requests, statuses, and decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::PolicyCheck;

/// One enrollment attempt. `request_id` carries exactly-once semantics: a
/// resubmission with the same id returns the original decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    pub request_id: Uuid,
    pub student_id: Uuid,
    pub section_id: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    Waitlisted,
    Dropped,
    Cancelled,
}

/// Machine-readable denial reasons surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyCode {
    MissingPrereq,
    PoorStanding,
    TimeConflict,
    Full,
    CreditLimit,
    WindowClosed,
    DeadlinePassed,
    Duplicate,
    UnknownSection,
    UnknownStudent,
    Busy,
    Transient,
    Timeout,
}

impl DenyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyCode::MissingPrereq => "MISSING_PREREQ",
            DenyCode::PoorStanding => "POOR_STANDING",
            DenyCode::TimeConflict => "TIME_CONFLICT",
            DenyCode::Full => "FULL",
            DenyCode::CreditLimit => "CREDIT_LIMIT",
            DenyCode::WindowClosed => "WINDOW_CLOSED",
            DenyCode::DeadlinePassed => "DEADLINE_PASSED",
            DenyCode::Duplicate => "DUPLICATE",
            DenyCode::UnknownSection => "UNKNOWN_SECTION",
            DenyCode::UnknownStudent => "UNKNOWN_STUDENT",
            DenyCode::Busy => "BUSY",
            DenyCode::Transient => "TRANSIENT",
            DenyCode::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for DenyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of a coordinator operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Enrolled,
    Waitlisted,
    Dropped,
    Cancelled,
    Denied(DenyCode),
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: Verdict,
    pub enrollment_id: Option<Uuid>,
    pub message: Option<String>,
    pub policy_trace: Vec<PolicyCheck>,
}

impl Decision {
    pub fn enrolled(enrollment_id: Uuid, policy_trace: Vec<PolicyCheck>) -> Self {
        Self {
            verdict: Verdict::Enrolled,
            enrollment_id: Some(enrollment_id),
            message: None,
            policy_trace,
        }
    }

    pub fn waitlisted(policy_trace: Vec<PolicyCheck>) -> Self {
        Self {
            verdict: Verdict::Waitlisted,
            enrollment_id: None,
            message: None,
            policy_trace,
        }
    }

    pub fn dropped(enrollment_id: Uuid) -> Self {
        Self {
            verdict: Verdict::Dropped,
            enrollment_id: Some(enrollment_id),
            message: None,
            policy_trace: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            verdict: Verdict::Cancelled,
            enrollment_id: None,
            message: None,
            policy_trace: Vec::new(),
        }
    }

    pub fn denied(code: DenyCode, message: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Denied(code),
            enrollment_id: None,
            message: Some(message.into()),
            policy_trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, policy_trace: Vec<PolicyCheck>) -> Self {
        self.policy_trace = policy_trace;
        self
    }
}
