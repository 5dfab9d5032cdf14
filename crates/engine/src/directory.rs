//! Campus directory collaborator: read-only section and student metadata.
//!
//! The engine consumes this data but does not own it. Production deployments
//! point the trait at the campus SIS; the in-memory implementation backs
//! tests and the standalone server, seeded from a JSON catalog.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use registrar_domain::{Section, Standing, StudentProfile, TimeSlot};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CampusDirectory: Send + Sync {
    async fn get_section(&self, section_id: &str) -> Result<Section, DirectoryError>;
    async fn get_student_profile(&self, student_id: Uuid)
    -> Result<StudentProfile, DirectoryError>;
}

/// Seedable in-memory directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    sections: DashMap<String, Section>,
    students: DashMap<Uuid, StudentProfile>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_section(&self, section: Section) {
        self.sections.insert(section.section_id.clone(), section);
    }

    pub fn insert_student(&self, profile: StudentProfile) {
        self.students.insert(profile.student_id, profile);
    }

    /// Load a catalog file. Sections without an explicit add/drop deadline
    /// get one at `now + add_drop_offset`.
    pub fn from_catalog_file(
        path: &Path,
        add_drop_offset: Duration,
    ) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog: Catalog = serde_json::from_str(&raw)?;
        let directory = Self::new();
        let default_deadline = Utc::now() + add_drop_offset;
        for entry in catalog.sections {
            directory.insert_section(entry.into_section(default_deadline));
        }
        for student in catalog.students {
            directory.insert_student(student);
        }
        Ok(directory)
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn student_count(&self) -> usize {
        self.students.len()
    }
}

#[async_trait]
impl CampusDirectory for InMemoryDirectory {
    async fn get_section(&self, section_id: &str) -> Result<Section, DirectoryError> {
        self.sections
            .get(section_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DirectoryError::NotFound(format!("section {section_id}")))
    }

    async fn get_student_profile(
        &self,
        student_id: Uuid,
    ) -> Result<StudentProfile, DirectoryError> {
        self.students
            .get(&student_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| DirectoryError::NotFound(format!("student {student_id}")))
    }
}

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default)]
    sections: Vec<CatalogSection>,
    #[serde(default)]
    students: Vec<StudentProfile>,
}

#[derive(Debug, Deserialize)]
struct CatalogSection {
    section_id: String,
    course_id: String,
    schedule: Vec<TimeSlot>,
    max_capacity: u32,
    instructor_id: String,
    #[serde(default)]
    add_drop_deadline: Option<DateTime<Utc>>,
    semester: String,
    #[serde(default)]
    prerequisites: BTreeSet<String>,
    min_standing: Standing,
    credits: u32,
}

impl CatalogSection {
    fn into_section(self, default_deadline: DateTime<Utc>) -> Section {
        Section {
            section_id: self.section_id,
            course_id: self.course_id,
            schedule: self.schedule,
            max_capacity: self.max_capacity,
            instructor_id: self.instructor_id,
            add_drop_deadline: Some(self.add_drop_deadline.unwrap_or(default_deadline)),
            semester: self.semester,
            prerequisites: self.prerequisites,
            min_standing: self.min_standing,
            credits: self.credits,
        }
    }
}
