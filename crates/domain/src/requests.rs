//! Ingress and egress DTOs for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::aggregate::{ActiveEnrollment, PastEnrollment, StudentAggregate, WaitlistEntry};
use crate::enrollment::{Decision, DenyCode, Verdict};
use crate::policy::PolicyCheck;
use crate::schedule::TimeSlot;

/// Enrollment submission.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitEnrollmentBody {
    pub request_id: Uuid,
    pub student_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub section_id: String,
}

/// Drop an enrolled seat.
#[derive(Debug, Deserialize, Validate)]
pub struct DropEnrollmentBody {
    pub enrollment_id: Uuid,
}

/// Leave a section waitlist.
#[derive(Debug, Deserialize, Validate)]
pub struct CancelWaitlistBody {
    pub student_id: Uuid,
    #[validate(length(min = 1, max = 64))]
    pub section_id: String,
}

/// Successful decision response (enrolled, waitlisted, dropped, cancelled).
#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub verdict: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_id: Option<Uuid>,
    pub policy_trace: Vec<PolicyCheck>,
}

/// Denied decision response, served with status 409.
#[derive(Debug, Serialize)]
pub struct DeniedResponse {
    pub reason_code: DenyCode,
    pub message: String,
    pub policy_trace: Vec<PolicyCheck>,
}

impl Decision {
    /// Split a decision into the 200 / 409 response shapes. `Err` carries the
    /// denial body.
    pub fn into_response_parts(self) -> Result<DecisionResponse, DeniedResponse> {
        match self.verdict {
            Verdict::Enrolled => Ok(DecisionResponse {
                verdict: "enrolled",
                enrollment_id: self.enrollment_id,
                policy_trace: self.policy_trace,
            }),
            Verdict::Waitlisted => Ok(DecisionResponse {
                verdict: "waitlisted",
                enrollment_id: None,
                policy_trace: self.policy_trace,
            }),
            Verdict::Dropped => Ok(DecisionResponse {
                verdict: "dropped",
                enrollment_id: self.enrollment_id,
                policy_trace: self.policy_trace,
            }),
            Verdict::Cancelled => Ok(DecisionResponse {
                verdict: "cancelled",
                enrollment_id: None,
                policy_trace: self.policy_trace,
            }),
            Verdict::Denied(code) => Err(DeniedResponse {
                reason_code: code,
                message: self
                    .message
                    .unwrap_or_else(|| code.as_str().to_string()),
                policy_trace: self.policy_trace,
            }),
        }
    }
}

/// One active enrollment in a student view.
#[derive(Debug, Serialize)]
pub struct EnrollmentView {
    pub enrollment_id: Uuid,
    pub section_id: String,
    pub credits: u32,
    pub schedule: Vec<TimeSlot>,
    pub enrolled_at: DateTime<Utc>,
}

impl From<&ActiveEnrollment> for EnrollmentView {
    fn from(e: &ActiveEnrollment) -> Self {
        Self {
            enrollment_id: e.enrollment_id,
            section_id: e.section_id.clone(),
            credits: e.credits,
            schedule: e.schedule.clone(),
            enrolled_at: e.enrolled_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WaitlistView {
    pub section_id: String,
    pub position: u32,
    pub waitlisted_at: DateTime<Utc>,
}

impl From<&WaitlistEntry> for WaitlistView {
    fn from(w: &WaitlistEntry) -> Self {
        Self {
            section_id: w.section_id.clone(),
            position: w.position,
            waitlisted_at: w.waitlisted_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryView {
    pub enrollment_id: Uuid,
    pub section_id: String,
    pub dropped_at: DateTime<Utc>,
}

impl From<&PastEnrollment> for HistoryView {
    fn from(p: &PastEnrollment) -> Self {
        Self {
            enrollment_id: p.enrollment_id,
            section_id: p.section_id.clone(),
            dropped_at: p.dropped_at,
        }
    }
}

/// Student stream view: current enrollments plus recent history.
#[derive(Debug, Serialize)]
pub struct EnrollmentsResponse {
    pub student_id: Uuid,
    pub credits_this_term: u32,
    pub enrolled: Vec<EnrollmentView>,
    pub waitlisted: Vec<WaitlistView>,
    pub history: Vec<HistoryView>,
}

impl EnrollmentsResponse {
    /// Project an aggregate into the response, keeping only history entries
    /// dropped after `history_cutoff`.
    pub fn from_aggregate(aggregate: &StudentAggregate, history_cutoff: DateTime<Utc>) -> Self {
        Self {
            student_id: aggregate.student_id,
            credits_this_term: aggregate.credits_this_term,
            enrolled: aggregate.active.values().map(EnrollmentView::from).collect(),
            waitlisted: aggregate
                .waitlisted
                .values()
                .map(WaitlistView::from)
                .collect(),
            history: aggregate
                .history
                .iter()
                .filter(|p| p.dropped_at >= history_cutoff)
                .map(HistoryView::from)
                .collect(),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Ready check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub database: String,
}
