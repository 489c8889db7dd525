use anyhow::Result;
use std::time::Duration;
use tempfile::tempdir;

use occupancy_kernel::{
    write_records_csv, ActuatorState, BoundingBox, DetectionEvent, FinishedSession, Frame,
    LogArchive, OccupancySession, SessionSettings, SqliteLogArchive, StreamEnd,
};

fn run_session(name: &str, presence: &[bool]) -> Result<FinishedSession> {
    let mut session = OccupancySession::new(name, &SessionSettings::default());
    for (i, present) in presence.iter().enumerate() {
        let detections = if *present {
            vec![DetectionEvent {
                class_id: 0,
                bounding_box: BoundingBox::new(2.0, 2.0, 10.0, 14.0),
                confidence: 0.8,
            }]
        } else {
            Vec::new()
        };
        let mut frame = Frame::filled(32, 32, [40, 40, 40], i as u64 + 1)?;
        session.process_frame(&mut frame, Ok(detections), Duration::from_secs(i as u64));
    }
    Ok(session.finish(StreamEnd::Exhausted))
}

#[test]
fn archived_sessions_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("occupancy.db");
    let db = db_path.to_string_lossy().to_string();

    let first = run_session("office", &[false, true, true, false, false, false, false])?;
    let second = run_session("office", &[true, true])?;
    let other = run_session("lobby", &[false])?;
    {
        let mut archive = SqliteLogArchive::open(&db)?;
        archive.archive_session(&first)?;
        archive.archive_session(&second)?;
        archive.archive_session(&other)?;
    }

    let mut archive = SqliteLogArchive::open(&db)?;
    let all = archive.list_sessions(None)?;
    assert_eq!(all.len(), 3);
    let office = archive.list_sessions(Some("office"))?;
    assert_eq!(
        office.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        vec![first.id.as_str(), second.id.as_str()]
    );

    let meta = &office[0];
    assert_eq!(meta.record_count, 7);
    assert_eq!(meta.transitions_on, 1);
    // Last seen at t=2; t=6 is the first sample more than 3s later.
    assert_eq!(meta.transitions_off, 1);
    assert_eq!(meta.final_state, ActuatorState::Off);
    assert_eq!(meta.end_reason, "source exhausted");

    assert_eq!(archive.load_records(&first.id)?, first.records);
    Ok(())
}

#[test]
fn resolve_prefers_ids_then_latest_stream_session() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("occupancy.db").to_string_lossy().to_string();
    let older = run_session("garage", &[true])?;
    let newer = run_session("garage", &[false, false])?;

    let mut archive = SqliteLogArchive::open(&db)?;
    archive.archive_session(&older)?;
    archive.archive_session(&newer)?;

    assert_eq!(archive.resolve("garage")?.id, newer.id);
    assert_eq!(archive.resolve(&older.id)?.id, older.id);
    assert!(archive.resolve("attic").is_err());
    assert!(archive.load_records("missing").is_err());
    Ok(())
}

#[test]
fn duplicate_archive_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("occupancy.db").to_string_lossy().to_string();
    let session = run_session("office", &[true])?;

    let mut archive = SqliteLogArchive::open(&db)?;
    archive.archive_session(&session)?;
    assert!(archive.archive_session(&session).is_err());
    assert_eq!(archive.list_sessions(None)?.len(), 1);
    Ok(())
}

#[test]
fn archived_log_exports_same_csv() -> Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("occupancy.db").to_string_lossy().to_string();
    let session = run_session("office", &[true, false, false, false, false])?;

    let mut archive = SqliteLogArchive::open(&db)?;
    archive.archive_session(&session)?;
    let loaded = archive.load_records(&session.id)?;

    let mut original = Vec::new();
    write_records_csv(&session.records, &mut original)?;
    let mut exported = Vec::new();
    write_records_csv(&loaded, &mut exported)?;
    assert_eq!(original, exported);

    let text = String::from_utf8(exported)?;
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "timestamp,person_detected,AC_status");
    assert_eq!(lines.len(), 6);
    assert!(lines[1].ends_with(",1,ON"));
    assert!(lines[5].ends_with(",0,OFF"));
    Ok(())
}
