mod support {
    pub mod fixtures;
    pub mod sqlite;
}

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use registrar_domain::{DayOfWeek, DenyCode, EnrollmentRequest, Verdict, section_stream};
use registrar_engine::EngineConfig;
use registrar_storage::EventStore;
use support::fixtures::{profile, section, setup_engine, slot, student_actor};

const WORKERS: usize = 50;
const REQUESTS_PER_WORKER: usize = 100;
const SECTIONS: usize = 10;
const CAPACITY: u32 = 5;
const MAX_WAITLIST: u32 = 3;

fn section_id(i: usize) -> String {
    format!("SEC{i:02}-A")
}

/// Spread the sections across disjoint meeting times so admissions are
/// decided by capacity, not by schedule collisions.
fn section_slot(i: usize) -> (DayOfWeek, u16, u16) {
    let day = match i % 5 {
        0 => DayOfWeek::Mon,
        1 => DayOfWeek::Tue,
        2 => DayOfWeek::Wed,
        3 => DayOfWeek::Thu,
        _ => DayOfWeek::Fri,
    };
    let start = 480 + (i / 5) as u16 * 120;
    (day, start, start + 60)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stress_many_workers_preserve_every_invariant() {
    let t = setup_engine(EngineConfig {
        max_waitlist: MAX_WAITLIST,
        // Generous credit budget: admissions here should be decided by
        // capacity alone.
        credit_cap_default: u32::MAX,
        section_cache_ttl: Duration::from_secs(60),
        ..EngineConfig::default()
    })
    .await
    .expect("engine fixture");

    for i in 0..SECTIONS {
        let (day, start, end) = section_slot(i);
        t.directory
            .insert_section(section(&section_id(i), CAPACITY, vec![slot(day, start, end)]));
    }

    let students: Vec<Uuid> = (0..WORKERS).map(|_| Uuid::new_v4()).collect();
    for &student in &students {
        t.directory.insert_student(profile(student));
    }

    let mut handles = Vec::new();
    for &student in &students {
        let engine = t.engine.clone();
        handles.push(tokio::spawn(async move {
            let mut enrolled: Vec<Uuid> = Vec::new();
            let mut counts: HashMap<&'static str, usize> = HashMap::new();
            for _ in 0..REQUESTS_PER_WORKER {
                let drop_one = {
                    let mut rng = rand::thread_rng();
                    !enrolled.is_empty() && rng.gen_bool(0.3)
                };
                if drop_one {
                    let enrollment_id = enrolled.pop().expect("non-empty");
                    let decision = engine
                        .drop_enrollment(student_actor(student), enrollment_id, None)
                        .await
                        .expect("drop must not error");
                    match decision.verdict {
                        Verdict::Dropped => *counts.entry("dropped").or_default() += 1,
                        Verdict::Denied(DenyCode::Busy) => {
                            // Contended section; keep the seat and move on.
                            enrolled.push(enrollment_id);
                            *counts.entry("busy").or_default() += 1;
                        }
                        other => panic!("unexpected drop verdict under stress: {other:?}"),
                    }
                    continue;
                }

                let target = rand::thread_rng().gen_range(0..SECTIONS);
                let request = EnrollmentRequest {
                    request_id: Uuid::new_v4(),
                    student_id: student,
                    section_id: section_id(target),
                    submitted_at: chrono::Utc::now(),
                };
                let decision = engine
                    .submit_enrollment(student_actor(student), request, None)
                    .await
                    .expect("submit must not error");
                match decision.verdict {
                    Verdict::Enrolled => {
                        enrolled.push(decision.enrollment_id.expect("enrollment id"));
                        *counts.entry("enrolled").or_default() += 1;
                    }
                    Verdict::Waitlisted => *counts.entry("waitlisted").or_default() += 1,
                    Verdict::Denied(DenyCode::Full) => *counts.entry("full").or_default() += 1,
                    Verdict::Denied(DenyCode::Duplicate) => {
                        *counts.entry("duplicate").or_default() += 1;
                    }
                    Verdict::Denied(DenyCode::TimeConflict) => {
                        *counts.entry("time_conflict").or_default() += 1;
                    }
                    Verdict::Denied(DenyCode::Busy) => *counts.entry("busy").or_default() += 1,
                    other => panic!("unexpected verdict under stress: {other:?}"),
                }
            }
            counts
        }));
    }

    let mut totals: HashMap<&'static str, usize> = HashMap::new();
    for handle in handles {
        for (key, count) in handle.await.expect("worker must not panic") {
            *totals.entry(key).or_default() += count;
        }
    }

    // Every request produced a decision.
    assert_eq!(
        totals.values().sum::<usize>(),
        WORKERS * REQUESTS_PER_WORKER
    );
    assert!(totals.get("enrolled").copied().unwrap_or(0) > 0);

    // Seats never oversubscribed, waitlists never overflow, and every
    // student aggregate is coherent.
    for i in 0..SECTIONS {
        let state = t
            .engine
            .section_state(&section_id(i))
            .await
            .expect("section replay");
        assert!(
            state.enrolled_count <= CAPACITY,
            "section {i} oversubscribed: {}",
            state.enrolled_count
        );
        assert!(
            state.waitlist.len() as u32 <= MAX_WAITLIST,
            "section {i} waitlist overflow: {}",
            state.waitlist.len()
        );
    }

    for &student in &students {
        let aggregate = t
            .engine
            .student_enrollments(student)
            .await
            .expect("student replay");
        let mut seen_sections = std::collections::HashSet::new();
        for enrollment in aggregate.active.values() {
            assert!(
                seen_sections.insert(enrollment.section_id.clone()),
                "duplicate enrollment for {student} in {}",
                enrollment.section_id
            );
        }
    }

    // The global sweep agrees: zero violations.
    let report = t.engine.audit_state().await.expect("audit sweep");
    assert!(
        report.is_clean(),
        "invariant violations: {:?}",
        report.violations
    );

    // Stream versions are consecutive on every section stream.
    let store = EventStore::new(t.db.pool.clone());
    for i in 0..SECTIONS {
        let events = store
            .load(&section_stream(&section_id(i)), None)
            .await
            .expect("load section stream");
        for (idx, event) in events.iter().enumerate() {
            assert_eq!(event.stream_version, idx as u64 + 1);
        }
    }
}
