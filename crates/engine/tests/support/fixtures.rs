use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use registrar_domain::{
    Actor, DayOfWeek, EnrollmentRequest, Section, Standing, StudentProfile, TimeSlot, UserType,
};
use registrar_engine::{CampusDirectory, EngineConfig, EnrollmentEngine, InMemoryDirectory};

use super::sqlite::{SqliteTestDb, setup_test_db};

pub struct TestEngine {
    pub engine: Arc<EnrollmentEngine>,
    pub directory: Arc<InMemoryDirectory>,
    // Holds the temp database file open for the test's lifetime.
    pub db: SqliteTestDb,
}

pub async fn setup_engine(config: EngineConfig) -> Result<TestEngine, sqlx::Error> {
    let db = setup_test_db().await?;
    let directory = Arc::new(InMemoryDirectory::new());
    let engine = Arc::new(EnrollmentEngine::from_pool(
        db.pool.clone(),
        directory.clone() as Arc<dyn CampusDirectory>,
        config,
    ));
    Ok(TestEngine {
        engine,
        directory,
        db,
    })
}

pub fn slot(day: DayOfWeek, start: u16, end: u16) -> TimeSlot {
    TimeSlot::new(day, start, end).unwrap()
}

pub fn section(section_id: &str, max_capacity: u32, schedule: Vec<TimeSlot>) -> Section {
    Section {
        section_id: section_id.to_string(),
        course_id: section_id.split('-').next().unwrap_or(section_id).to_string(),
        schedule,
        max_capacity,
        instructor_id: "prof-1".to_string(),
        add_drop_deadline: Some(Utc::now() + Duration::days(7)),
        semester: "2026-fall".to_string(),
        prerequisites: Default::default(),
        min_standing: Standing::Freshman,
        credits: 3,
    }
}

pub fn profile(student_id: Uuid) -> StudentProfile {
    StudentProfile {
        student_id,
        completed_courses: Default::default(),
        gpa: 3.0,
        standing: Standing::Sophomore,
        priority_window_open_at: None,
        credit_cap: None,
    }
}

pub fn student_actor(student_id: Uuid) -> Actor {
    Actor {
        actor_id: student_id,
        user_type: UserType::Student,
    }
}

pub fn admin_actor() -> Actor {
    Actor {
        actor_id: Uuid::new_v4(),
        user_type: UserType::Admin,
    }
}

pub fn request(student_id: Uuid, section_id: &str) -> EnrollmentRequest {
    EnrollmentRequest {
        request_id: Uuid::new_v4(),
        student_id,
        section_id: section_id.to_string(),
        submitted_at: Utc::now(),
    }
}
