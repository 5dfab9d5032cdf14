mod support {
    pub mod fixtures;
    pub mod sqlite;
}

use std::time::Duration;

use uuid::Uuid;

use registrar_domain::{
    DayOfWeek, EventPayload, TimeSlot, Verdict, section_stream, student_stream,
};
use registrar_engine::{EngineConfig, InvariantKind};
use registrar_storage::EventStore;
use support::fixtures::{profile, request, section, setup_engine, slot, student_actor};

fn test_config() -> EngineConfig {
    EngineConfig {
        section_cache_ttl: Duration::ZERO,
        ..EngineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconcile_releases_orphaned_seats_and_promotes() {
    let t = setup_engine(test_config()).await.unwrap();
    t.directory
        .insert_section(section("CS101-A", 1, vec![slot(DayOfWeek::Mon, 600, 690)]));

    let holder = Uuid::new_v4();
    let waiter = Uuid::new_v4();
    t.directory.insert_student(profile(holder));
    t.directory.insert_student(profile(waiter));

    let enrolled = t
        .engine
        .submit_enrollment(student_actor(holder), request(holder, "CS101-A"), None)
        .await
        .unwrap();
    let enrollment_id = enrolled.enrollment_id.unwrap();
    let waitlisted = t
        .engine
        .submit_enrollment(student_actor(waiter), request(waiter, "CS101-A"), None)
        .await
        .unwrap();
    assert_eq!(waitlisted.verdict, Verdict::Waitlisted);

    // Simulate a coordinator that died between the two halves of a drop:
    // the student stream says dropped, the section stream still counts the
    // seat.
    let store = EventStore::new(t.db.pool.clone());
    let student_head = store.current_version(&student_stream(holder)).await.unwrap();
    store
        .append(
            &student_stream(holder),
            student_head,
            Uuid::new_v4(),
            &EventPayload::Dropped {
                enrollment_id,
                student_id: holder,
                section_id: "CS101-A".to_string(),
            },
        )
        .await
        .unwrap();

    let stale = t.engine.section_state("CS101-A").await.unwrap();
    assert_eq!(stale.enrolled_count, 1);

    t.engine.reconcile().await.unwrap();

    // The orphaned seat was released and the waiter promoted into it.
    let settled = t.engine.section_state("CS101-A").await.unwrap();
    assert_eq!(settled.enrolled_count, 1);
    assert!(settled.waitlist.is_empty());

    let waiter_state = t.engine.student_enrollments(waiter).await.unwrap();
    assert_eq!(waiter_state.active.len(), 1);
    assert!(waiter_state.waitlisted.is_empty());

    let report = t.engine.audit_state().await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn audit_state_reports_capacity_overruns() {
    let t = setup_engine(test_config()).await.unwrap();
    t.directory
        .insert_section(section("CS101-A", 1, vec![slot(DayOfWeek::Mon, 600, 690)]));

    // Two seats written directly, bypassing the policy engine.
    let store = EventStore::new(t.db.pool.clone());
    for version in 0..2u64 {
        store
            .append(
                &section_stream("CS101-A"),
                version,
                Uuid::new_v4(),
                &EventPayload::CapacityConsumed {
                    enrollment_id: Uuid::new_v4(),
                    student_id: Uuid::new_v4(),
                },
            )
            .await
            .unwrap();
    }

    let report = t.engine.audit_state().await.unwrap();
    let violation = report
        .violations
        .iter()
        .find(|v| v.invariant == InvariantKind::CapacityExceeded)
        .expect("capacity violation");
    assert_eq!(violation.stream_id, section_stream("CS101-A"));
    assert_eq!(violation.witnesses.len(), 2);
}

#[tokio::test]
async fn audit_state_reports_overlaps_and_duplicates() {
    let t = setup_engine(test_config()).await.unwrap();
    let student = Uuid::new_v4();
    t.directory.insert_student(profile(student));

    let store = EventStore::new(t.db.pool.clone());
    let stream = student_stream(student);
    let monday_morning = vec![TimeSlot::new(DayOfWeek::Mon, 600, 690).unwrap()];

    // Two overlapping enrollments plus a duplicate of the first section,
    // written directly, bypassing the policy engine.
    let payloads = [
        ("CS101-A", monday_morning.clone()),
        ("MATH200-B", vec![TimeSlot::new(DayOfWeek::Mon, 630, 720).unwrap()]),
        ("CS101-A", monday_morning),
    ];
    for (version, (section_id, schedule)) in payloads.into_iter().enumerate() {
        store
            .append(
                &stream,
                version as u64,
                Uuid::new_v4(),
                &EventPayload::Enrolled {
                    enrollment_id: Uuid::new_v4(),
                    student_id: student,
                    section_id: section_id.to_string(),
                    credits: 3,
                    schedule,
                },
            )
            .await
            .unwrap();
    }

    let report = t.engine.audit_state().await.unwrap();
    assert!(
        report
            .violations
            .iter()
            .any(|v| v.invariant == InvariantKind::ScheduleOverlap)
    );
    let duplicate = report
        .violations
        .iter()
        .find(|v| v.invariant == InvariantKind::DuplicateEnrollment)
        .expect("duplicate violation");
    assert_eq!(duplicate.witnesses.len(), 2);
}

#[tokio::test]
async fn audit_state_reports_a_tampered_audit_chain() {
    let t = setup_engine(test_config()).await.unwrap();
    let student = Uuid::new_v4();
    t.directory.insert_student(profile(student));
    t.directory
        .insert_section(section("CS101-A", 30, vec![slot(DayOfWeek::Mon, 600, 690)]));

    t.engine
        .submit_enrollment(student_actor(student), request(student, "CS101-A"), None)
        .await
        .unwrap();

    sqlx::query("UPDATE audit_log SET actor_id = 'impostor' WHERE seq = 0")
        .execute(&t.db.pool)
        .await
        .unwrap();

    let report = t.engine.audit_state().await.unwrap();
    assert!(
        report
            .violations
            .iter()
            .any(|v| v.invariant == InvariantKind::AuditChain)
    );
}
