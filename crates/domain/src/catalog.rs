//! Catalog records owned by external collaborators and cached locally.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::TimeSlot;

/// Academic standing, ordered from lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Standing {
    Freshman,
    Sophomore,
    Junior,
    Senior,
    Graduate,
}

/// Course section metadata. The enrolled count is deliberately absent: the
/// authoritative count is derived from the section's event stream, never from
/// the cached record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub section_id: String,
    pub course_id: String,
    pub schedule: Vec<TimeSlot>,
    pub max_capacity: u32,
    pub instructor_id: String,
    pub add_drop_deadline: Option<DateTime<Utc>>,
    pub semester: String,
    #[serde(default)]
    pub prerequisites: BTreeSet<String>,
    pub min_standing: Standing,
    pub credits: u32,
}

/// Student record from the identity collaborator. Flat: stable id, schema
/// version on the stored form, role attributes inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentProfile {
    pub student_id: Uuid,
    #[serde(default)]
    pub completed_courses: BTreeSet<String>,
    pub gpa: f32,
    pub standing: Standing,
    /// Before this instant the student may not enroll at all.
    pub priority_window_open_at: Option<DateTime<Utc>>,
    /// Per-term credit cap override; the configured default applies when absent.
    pub credit_cap: Option<u32>,
}
