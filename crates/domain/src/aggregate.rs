//! Event-sourced aggregates.
//!
//! An aggregate is rebuilt by folding `apply` over its stream, optionally
//! starting from a persisted snapshot. `apply` is a pure function of
//! (state, event); replay is therefore deterministic and equality between a
//! full replay and a snapshot-plus-tail replay is a testable law.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::enrollment::EnrollmentStatus;
use crate::events::{EventEnvelope, EventPayload};
use crate::schedule::{TimeSlot, any_overlap};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("stream {stream_id} has a version gap: expected {expected}, found {found}")]
    VersionGap {
        stream_id: String,
        expected: u64,
        found: u64,
    },
    #[error("snapshot for {stream_id} is not readable: {source}")]
    BadSnapshot {
        stream_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A persisted aggregate state at a specific stream version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: String,
    pub version: u64,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEnrollment {
    pub enrollment_id: Uuid,
    pub section_id: String,
    pub credits: u32,
    pub schedule: Vec<TimeSlot>,
    pub enrolled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub section_id: String,
    pub position: u32,
    pub waitlisted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastEnrollment {
    pub enrollment_id: Uuid,
    pub section_id: String,
    pub dropped_at: DateTime<Utc>,
}

/// Per-student state rebuilt from the student stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentAggregate {
    pub student_id: Uuid,
    pub version: u64,
    /// Active enrollments keyed by enrollment id.
    pub active: BTreeMap<Uuid, ActiveEnrollment>,
    /// Waitlist memberships keyed by section id.
    pub waitlisted: BTreeMap<String, WaitlistEntry>,
    pub history: Vec<PastEnrollment>,
    pub credits_this_term: u32,
}

impl StudentAggregate {
    pub fn new(student_id: Uuid) -> Self {
        Self {
            student_id,
            version: 0,
            active: BTreeMap::new(),
            waitlisted: BTreeMap::new(),
            history: Vec::new(),
            credits_this_term: 0,
        }
    }

    /// Fold one event into the state. Payloads that only belong on section
    /// streams are ignored.
    pub fn apply(&mut self, event: &EventEnvelope) {
        self.version = event.stream_version;
        match &event.payload {
            EventPayload::Enrolled {
                enrollment_id,
                section_id,
                credits,
                schedule,
                ..
            }
            | EventPayload::Promoted {
                enrollment_id,
                section_id,
                credits,
                schedule,
                ..
            } => {
                self.waitlisted.remove(section_id);
                self.active.insert(
                    *enrollment_id,
                    ActiveEnrollment {
                        enrollment_id: *enrollment_id,
                        section_id: section_id.clone(),
                        credits: *credits,
                        schedule: schedule.clone(),
                        enrolled_at: event.occurred_at,
                    },
                );
                self.credits_this_term += credits;
            }
            EventPayload::Dropped {
                enrollment_id,
                section_id,
                ..
            } => {
                if let Some(gone) = self.active.remove(enrollment_id) {
                    self.credits_this_term = self.credits_this_term.saturating_sub(gone.credits);
                }
                self.history.push(PastEnrollment {
                    enrollment_id: *enrollment_id,
                    section_id: section_id.clone(),
                    dropped_at: event.occurred_at,
                });
            }
            EventPayload::Waitlisted {
                section_id,
                position,
                ..
            } => {
                self.waitlisted.insert(
                    section_id.clone(),
                    WaitlistEntry {
                        section_id: section_id.clone(),
                        position: *position,
                        waitlisted_at: event.occurred_at,
                    },
                );
            }
            EventPayload::WaitlistCancelled { section_id, .. } => {
                self.waitlisted.remove(section_id);
            }
            EventPayload::RequestRejected { .. }
            | EventPayload::CapacityConsumed { .. }
            | EventPayload::CapacityReleased { .. } => {}
        }
    }

    /// Rebuild from an optional snapshot plus the events after it. Events
    /// must be consecutive; a gap is a storage-level defect surfaced as an
    /// error rather than silently folded over.
    pub fn replay(
        student_id: Uuid,
        snapshot: Option<&Snapshot>,
        events: &[EventEnvelope],
    ) -> Result<Self, AggregateError> {
        let mut state = match snapshot {
            Some(snap) => serde_json::from_value(snap.state.clone()).map_err(|source| {
                AggregateError::BadSnapshot {
                    stream_id: snap.stream_id.clone(),
                    source,
                }
            })?,
            None => Self::new(student_id),
        };
        for event in events {
            if event.stream_version != state.version + 1 {
                return Err(AggregateError::VersionGap {
                    stream_id: event.stream_id.clone(),
                    expected: state.version + 1,
                    found: event.stream_version,
                });
            }
            state.apply(event);
        }
        Ok(state)
    }

    pub fn enrollment_in(&self, section_id: &str) -> Option<&ActiveEnrollment> {
        self.active.values().find(|e| e.section_id == section_id)
    }

    /// Lifecycle status of a known enrollment.
    pub fn status_of(&self, enrollment_id: Uuid) -> Option<EnrollmentStatus> {
        if self.active.contains_key(&enrollment_id) {
            return Some(EnrollmentStatus::Enrolled);
        }
        self.history
            .iter()
            .any(|p| p.enrollment_id == enrollment_id)
            .then_some(EnrollmentStatus::Dropped)
    }

    /// First active enrollment whose schedule collides with `schedule`.
    pub fn time_conflict_with(&self, schedule: &[TimeSlot]) -> Option<&ActiveEnrollment> {
        self.active
            .values()
            .find(|e| any_overlap(&e.schedule, schedule))
    }

    /// Compact state summary used in audit entries.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.version,
            "active_enrollments": self.active.len(),
            "waitlisted_sections": self.waitlisted.len(),
            "credits_this_term": self.credits_this_term,
        })
    }
}

/// Per-section state rebuilt from the section stream: seat accounting plus
/// the FIFO waitlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionAggregate {
    pub section_id: String,
    pub version: u64,
    pub enrolled_count: u32,
    /// Seats in use, keyed by enrollment id.
    pub enrolled: BTreeMap<Uuid, Uuid>,
    /// Waiting students, head first.
    pub waitlist: Vec<Uuid>,
}

impl SectionAggregate {
    pub fn new(section_id: impl Into<String>) -> Self {
        Self {
            section_id: section_id.into(),
            version: 0,
            enrolled_count: 0,
            enrolled: BTreeMap::new(),
            waitlist: Vec::new(),
        }
    }

    pub fn apply(&mut self, event: &EventEnvelope) {
        self.version = event.stream_version;
        match &event.payload {
            EventPayload::CapacityConsumed {
                enrollment_id,
                student_id,
            } => {
                self.enrolled.insert(*enrollment_id, *student_id);
                self.enrolled_count += 1;
            }
            EventPayload::CapacityReleased { enrollment_id, .. } => {
                self.enrolled.remove(enrollment_id);
                self.enrolled_count = self.enrolled_count.saturating_sub(1);
            }
            EventPayload::Waitlisted { student_id, .. } => {
                self.waitlist.push(*student_id);
            }
            EventPayload::WaitlistCancelled { student_id, .. } => {
                if let Some(pos) = self.waitlist.iter().position(|s| s == student_id) {
                    self.waitlist.remove(pos);
                }
            }
            EventPayload::Promoted {
                enrollment_id,
                student_id,
                ..
            } => {
                if let Some(pos) = self.waitlist.iter().position(|s| s == student_id) {
                    self.waitlist.remove(pos);
                }
                self.enrolled.insert(*enrollment_id, *student_id);
                self.enrolled_count += 1;
            }
            EventPayload::Enrolled { .. }
            | EventPayload::Dropped { .. }
            | EventPayload::RequestRejected { .. } => {}
        }
    }

    pub fn replay(
        section_id: &str,
        snapshot: Option<&Snapshot>,
        events: &[EventEnvelope],
    ) -> Result<Self, AggregateError> {
        let mut state = match snapshot {
            Some(snap) => serde_json::from_value(snap.state.clone()).map_err(|source| {
                AggregateError::BadSnapshot {
                    stream_id: snap.stream_id.clone(),
                    source,
                }
            })?,
            None => Self::new(section_id),
        };
        for event in events {
            if event.stream_version != state.version + 1 {
                return Err(AggregateError::VersionGap {
                    stream_id: event.stream_id.clone(),
                    expected: state.version + 1,
                    found: event.stream_version,
                });
            }
            state.apply(event);
        }
        Ok(state)
    }

    pub fn head_waiter(&self) -> Option<Uuid> {
        self.waitlist.first().copied()
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.version,
            "enrolled_count": self.enrolled_count,
            "waitlist_len": self.waitlist.len(),
        })
    }
}
