//! Weekly schedule model: wall-clock time slots and the overlap predicate.
//!
//! All times are minutes from midnight in the configured semester timezone.
//! The engine performs no DST arithmetic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid time slot: start {start} is not before end {end}")]
    EmptySlot { start: u16, end: u16 },
    #[error("invalid time slot: minute {minute} is past the end of the day")]
    OutOfRange { minute: u16 },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

/// One weekly meeting block. Constructed only through [`TimeSlot::new`], so a
/// slot in hand always satisfies `start < end` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SlotParts", into = "SlotParts")]
pub struct TimeSlot {
    day: DayOfWeek,
    start: u16,
    end: u16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SlotParts {
    day: DayOfWeek,
    start: u16,
    end: u16,
}

impl TryFrom<SlotParts> for TimeSlot {
    type Error = ScheduleError;

    fn try_from(parts: SlotParts) -> Result<Self, Self::Error> {
        TimeSlot::new(parts.day, parts.start, parts.end)
    }
}

impl From<TimeSlot> for SlotParts {
    fn from(slot: TimeSlot) -> Self {
        Self {
            day: slot.day,
            start: slot.start,
            end: slot.end,
        }
    }
}

impl TimeSlot {
    pub fn new(day: DayOfWeek, start: u16, end: u16) -> Result<Self, ScheduleError> {
        if end > MINUTES_PER_DAY {
            return Err(ScheduleError::OutOfRange { minute: end });
        }
        if start >= end {
            return Err(ScheduleError::EmptySlot { start, end });
        }
        Ok(Self { day, start, end })
    }

    pub fn day(&self) -> DayOfWeek {
        self.day
    }

    /// Minutes from midnight, inclusive.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Minutes from midnight, exclusive.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Half-open interval test: two slots sharing only an endpoint (back to
    /// back meetings) do not overlap.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.day == other.day && self.start < other.end && other.start < self.end
    }
}

/// Pairwise overlap test across two schedules.
pub fn any_overlap(a: &[TimeSlot], b: &[TimeSlot]) -> bool {
    a.iter().any(|sa| b.iter().any(|sb| sa.overlaps(sb)))
}
