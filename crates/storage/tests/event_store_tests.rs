mod support {
    pub mod sqlite;
}

use uuid::Uuid;

use registrar_domain::{EventPayload, StudentAggregate, student_stream};
use registrar_storage::{EventStore, SnapshotStore, StorageError};
use support::sqlite::setup_test_db;

fn enrolled(student_id: Uuid, section_id: &str) -> EventPayload {
    EventPayload::Enrolled {
        enrollment_id: Uuid::new_v4(),
        student_id,
        section_id: section_id.to_string(),
        credits: 3,
        schedule: vec![],
    }
}

#[tokio::test]
async fn append_assigns_consecutive_versions() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let student = Uuid::new_v4();
    let stream = student_stream(student);

    let first = store
        .append(&stream, 0, Uuid::new_v4(), &enrolled(student, "CS101-A"))
        .await?;
    let second = store
        .append(&stream, 1, Uuid::new_v4(), &enrolled(student, "MATH200-B"))
        .await?;

    assert_eq!(first.stream_version, 1);
    assert_eq!(second.stream_version, 2);
    assert_eq!(store.current_version(&stream).await?, 2);

    let loaded = store.load(&stream, None).await?;
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0], first);
    assert_eq!(loaded[1], second);
    Ok(())
}

#[tokio::test]
async fn stale_expected_version_conflicts() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let student = Uuid::new_v4();
    let stream = student_stream(student);

    store
        .append(&stream, 0, Uuid::new_v4(), &enrolled(student, "CS101-A"))
        .await?;

    let err = store
        .append(&stream, 0, Uuid::new_v4(), &enrolled(student, "MATH200-B"))
        .await
        .unwrap_err();

    match err {
        StorageError::VersionConflict {
            expected, current, ..
        } => {
            assert_eq!(expected, 0);
            assert_eq!(current, 1);
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    // The stream is untouched by the failed append.
    assert_eq!(store.load(&stream, None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn future_expected_version_conflicts_without_creating_gaps()
-> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let student = Uuid::new_v4();
    let stream = student_stream(student);

    let err = store
        .append(&stream, 7, Uuid::new_v4(), &enrolled(student, "CS101-A"))
        .await
        .unwrap_err();
    assert!(err.is_version_conflict());
    assert_eq!(store.current_version(&stream).await?, 0);
    Ok(())
}

#[tokio::test]
async fn racing_appends_commit_exactly_one() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let student = Uuid::new_v4();
    let stream = student_stream(student);

    let a = {
        let store = store.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            store
                .append(&stream, 0, Uuid::new_v4(), &enrolled(student, "CS101-A"))
                .await
        })
    };
    let b = {
        let store = store.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            store
                .append(&stream, 0, Uuid::new_v4(), &enrolled(student, "MATH200-B"))
                .await
        })
    };

    let results = [a.await?, b.await?];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_version_conflict()))
        .count();

    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(store.current_version(&stream).await?, 1);
    Ok(())
}

#[tokio::test]
async fn load_after_version_returns_the_tail() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let student = Uuid::new_v4();
    let stream = student_stream(student);

    for version in 0..5u64 {
        store
            .append(
                &stream,
                version,
                Uuid::new_v4(),
                &enrolled(student, &format!("SEC-{version}")),
            )
            .await?;
    }

    let tail = store.load(&stream, Some(3)).await?;
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].stream_version, 4);
    assert_eq!(tail[1].stream_version, 5);
    Ok(())
}

#[tokio::test]
async fn causation_lookup_finds_all_events_of_a_request()
-> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let student = Uuid::new_v4();
    let request_id = Uuid::new_v4();
    let enrollment_id = Uuid::new_v4();

    store
        .append(
            &student_stream(student),
            0,
            request_id,
            &EventPayload::Enrolled {
                enrollment_id,
                student_id: student,
                section_id: "CS101-A".to_string(),
                credits: 3,
                schedule: vec![],
            },
        )
        .await?;
    store
        .append(
            "section:CS101-A",
            0,
            request_id,
            &EventPayload::CapacityConsumed {
                enrollment_id,
                student_id: student,
            },
        )
        .await?;

    let found = store.find_by_causation(request_id).await?;
    assert_eq!(found.len(), 2);
    assert!(matches!(found[0].payload, EventPayload::Enrolled { .. }));
    assert!(
        matches!(found[1].payload, EventPayload::CapacityConsumed { .. })
    );

    assert!(store.find_by_causation(Uuid::new_v4()).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn enrollment_lookup_resolves_the_owning_stream()
-> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let student = Uuid::new_v4();
    let stream = student_stream(student);
    let enrollment_id = Uuid::new_v4();

    store
        .append(
            &stream,
            0,
            Uuid::new_v4(),
            &EventPayload::Enrolled {
                enrollment_id,
                student_id: student,
                section_id: "CS101-A".to_string(),
                credits: 3,
                schedule: vec![],
            },
        )
        .await?;

    let found = store
        .find_enrollment_event(enrollment_id)
        .await?
        .expect("enrollment event");
    assert_eq!(found.stream_id, stream);

    assert!(store.find_enrollment_event(Uuid::new_v4()).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn stream_listing_filters_by_prefix() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let student = Uuid::new_v4();

    store
        .append(
            &student_stream(student),
            0,
            Uuid::new_v4(),
            &enrolled(student, "CS101-A"),
        )
        .await?;
    store
        .append(
            "section:CS101-A",
            0,
            Uuid::new_v4(),
            &EventPayload::CapacityConsumed {
                enrollment_id: Uuid::new_v4(),
                student_id: student,
            },
        )
        .await?;

    let students = store.list_streams("student:").await?;
    let sections = store.list_streams("section:").await?;
    assert_eq!(students, vec![student_stream(student)]);
    assert_eq!(sections, vec!["section:CS101-A".to_string()]);
    Ok(())
}

#[tokio::test]
async fn snapshot_round_trip_resumes_replay() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let store = EventStore::new(db.pool.clone());
    let snapshots = SnapshotStore::new(db.pool.clone());
    let student = Uuid::new_v4();
    let stream = student_stream(student);

    for version in 0..4u64 {
        store
            .append(
                &stream,
                version,
                Uuid::new_v4(),
                &enrolled(student, &format!("SEC-{version}")),
            )
            .await?;
    }

    let half = StudentAggregate::replay(student, None, &store.load(&stream, None).await?[..2])?;
    snapshots
        .save(&stream, half.version, &serde_json::to_value(&half)?)
        .await?;

    let snap = snapshots.latest(&stream).await?.expect("snapshot");
    assert_eq!(snap.version, 2);

    let tail = store.load(&stream, Some(snap.version)).await?;
    let resumed = StudentAggregate::replay(student, Some(&snap), &tail)?;
    let full = StudentAggregate::replay(student, None, &store.load(&stream, None).await?)?;
    assert_eq!(resumed, full);
    Ok(())
}

#[tokio::test]
async fn latest_snapshot_wins_over_older_ones() -> Result<(), Box<dyn std::error::Error>> {
    let db = setup_test_db().await?;
    let snapshots = SnapshotStore::new(db.pool.clone());

    snapshots
        .save("student:x", 10, &serde_json::json!({"v": 10}))
        .await?;
    snapshots
        .save("student:x", 20, &serde_json::json!({"v": 20}))
        .await?;

    let latest = snapshots.latest("student:x").await?.expect("snapshot");
    assert_eq!(latest.version, 20);
    assert!(snapshots.latest("student:y").await?.is_none());
    Ok(())
}
