//! Domain events and the envelope wire format.
//!
//! Events are frozen after write. Streams are named `student:<uuid>` and
//! `section:<section_id>`; an event carries enough payload that replaying a
//! stream never needs a catalog lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enrollment::DenyCode;
use crate::schedule::TimeSlot;

pub const STUDENT_STREAM_PREFIX: &str = "student:";
pub const SECTION_STREAM_PREFIX: &str = "section:";

pub fn student_stream(student_id: Uuid) -> String {
    format!("{STUDENT_STREAM_PREFIX}{student_id}")
}

pub fn section_stream(section_id: &str) -> String {
    format!("{SECTION_STREAM_PREFIX}{section_id}")
}

pub fn student_id_of(stream_id: &str) -> Option<Uuid> {
    stream_id
        .strip_prefix(STUDENT_STREAM_PREFIX)
        .and_then(|raw| raw.parse().ok())
}

pub fn section_id_of(stream_id: &str) -> Option<&str> {
    stream_id.strip_prefix(SECTION_STREAM_PREFIX)
}

/// Event payloads. Student streams carry the enrollment lifecycle; section
/// streams carry seat accounting and the waitlist queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// Student stream: a seat was granted.
    Enrolled {
        enrollment_id: Uuid,
        student_id: Uuid,
        section_id: String,
        credits: u32,
        schedule: Vec<TimeSlot>,
    },
    /// Student stream: an enrolled seat was given up.
    Dropped {
        enrollment_id: Uuid,
        student_id: Uuid,
        section_id: String,
    },
    /// Both streams: the student joined the section waitlist.
    Waitlisted {
        student_id: Uuid,
        section_id: String,
        position: u32,
    },
    /// Both streams: the student left the waitlist without a seat.
    WaitlistCancelled {
        student_id: Uuid,
        section_id: String,
    },
    /// Both streams: the head waiter was granted a freed seat.
    Promoted {
        enrollment_id: Uuid,
        student_id: Uuid,
        section_id: String,
        credits: u32,
        schedule: Vec<TimeSlot>,
    },
    /// Section stream: one seat consumed by a direct enrollment.
    CapacityConsumed {
        enrollment_id: Uuid,
        student_id: Uuid,
    },
    /// Section stream: one seat released by a drop.
    CapacityReleased {
        enrollment_id: Uuid,
        student_id: Uuid,
    },
    /// Student stream: a denied request, recorded for audit.
    RequestRejected {
        student_id: Uuid,
        section_id: String,
        reason: DenyCode,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Enrolled { .. } => "enrolled",
            EventPayload::Dropped { .. } => "dropped",
            EventPayload::Waitlisted { .. } => "waitlisted",
            EventPayload::WaitlistCancelled { .. } => "waitlist_cancelled",
            EventPayload::Promoted { .. } => "promoted",
            EventPayload::CapacityConsumed { .. } => "capacity_consumed",
            EventPayload::CapacityReleased { .. } => "capacity_released",
            EventPayload::RequestRejected { .. } => "request_rejected",
        }
    }
}

/// Stored form of one event. `stream_version` starts at 1 and increases by
/// exactly 1 per append; `causation_id` ties the event to the request that
/// produced it. The serde flatten yields the wire fields
/// `{event_id, stream_id, stream_version, occurred_at, causation_id, type, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub stream_id: String,
    pub stream_version: u64,
    pub occurred_at: DateTime<Utc>,
    pub causation_id: Uuid,
    #[serde(flatten)]
    pub payload: EventPayload,
}
