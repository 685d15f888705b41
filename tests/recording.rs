use bmsmon_lib::matrix::{CellMatrix, Geometry, Snapshot};
use bmsmon_lib::measurement::{CellValue, MeasurementMode};
use bmsmon_lib::protocol::{Frame, RawFields};
use bmsmon_lib::recorder::{export_snapshot, Recording, SnapshotSource};
use bmsmon_lib::session::{SessionState, StreamSession};
use bmsmon_lib::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wire(cell_id: u8, instant_voltage: u16) -> Vec<u8> {
    Frame {
        cell_id,
        fields: RawFields {
            instant_voltage,
            resistance: 0,
            open_circuit_voltage: 0,
        },
    }
    .to_wire()
}

fn active_session() -> Arc<StreamSession> {
    let session = Arc::new(StreamSession::default());
    session
        .start(MeasurementMode::InstantaneousCellVoltage)
        .unwrap();
    session.feed(&wire(0, 0)).unwrap();
    session
}

fn read_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

#[test]
fn periodic_recording_writes_one_sample_per_tick() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recording.csv");
    let session = active_session();

    let recording =
        Recording::start(Arc::clone(&session), path.clone(), Duration::from_millis(20)).unwrap();
    assert_eq!(recording.path(), path);
    thread::sleep(Duration::from_millis(50));
    session.feed(&wire(95, 0xFFFF)).unwrap();
    thread::sleep(Duration::from_millis(50));
    let summary = recording.stop().unwrap();

    assert_eq!(summary.path, path);
    assert!(summary.samples >= 2, "only {} samples", summary.samples);
    let lines = read_lines(&path);
    assert_eq!(lines.len(), 1 + summary.samples * 12);
    assert_eq!(
        lines[0],
        "Time,Module 1,Module 2,Module 3,Module 4,Module 5,Module 6,Module 7,Module 8"
    );
    assert!(lines[1].ends_with(",1.5,NA,NA,NA,NA,NA,NA,NA"));
    // the last sample saw the second frame
    assert!(lines.last().unwrap().ends_with(",NA,NA,NA,NA,NA,NA,NA,11.33"));
}

#[test]
fn recording_needs_an_active_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.csv");
    let session = Arc::new(StreamSession::default());

    assert!(matches!(
        Recording::start(session, path.clone(), Duration::from_secs(1)),
        Err(Error::InvalidState {
            state: SessionState::Idle,
            ..
        })
    ));
    assert!(!path.exists());
}

#[test]
fn closing_the_session_finalizes_the_recording() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("closed.csv");
    let session = active_session();

    let recording =
        Recording::start(Arc::clone(&session), path.clone(), Duration::from_millis(10)).unwrap();
    thread::sleep(Duration::from_millis(25));
    session.stop();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !recording.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(recording.is_finished());
    let summary = recording.stop().unwrap();
    assert!(summary.samples >= 1);
    assert_eq!(read_lines(&path).len(), 1 + summary.samples * 12);
}

#[test]
fn export_while_recording() {
    let dir = tempfile::tempdir().unwrap();
    let recording_path = dir.path().join("recording.csv");
    let export_path = dir.path().join("export.csv");
    let session = active_session();

    let recording = Recording::start(
        Arc::clone(&session),
        recording_path.clone(),
        Duration::from_millis(10),
    )
    .unwrap();
    let timestamp = chrono::NaiveDate::from_ymd_opt(2025, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap();
    export_snapshot(&export_path, &session.snapshot().unwrap(), timestamp).unwrap();
    let summary = recording.stop().unwrap();

    let lines = read_lines(&export_path);
    assert_eq!(lines.len(), 13);
    assert_eq!(lines[1], "2025-01-02 03:04:05,1.5,NA,NA,NA,NA,NA,NA,NA");
    assert!(lines[2..].iter().all(|line| line.starts_with("2025-01-02 03:04:05,")));
    assert_eq!(read_lines(&recording_path).len(), 1 + summary.samples * 12);
}

/// Takes longer to produce a snapshot than the recording interval.
struct SlowSource {
    calls: AtomicUsize,
}

impl SnapshotSource for SlowSource {
    fn snapshot(&self) -> bmsmon_lib::Result<Snapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(15));
        let mut matrix = CellMatrix::new(Geometry::new(2, 2)?);
        matrix.set(
            Geometry::new(2, 2)?.locate(3).unwrap(),
            CellValue::Raw(self.calls.load(Ordering::SeqCst) as u16),
        );
        Ok(matrix.snapshot())
    }
}

#[test]
fn stop_waits_for_the_tick_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.csv");
    let source = Arc::new(SlowSource {
        calls: AtomicUsize::new(0),
    });

    let recording =
        Recording::start(Arc::clone(&source), path.clone(), Duration::from_millis(5)).unwrap();
    thread::sleep(Duration::from_millis(40));
    let summary = recording.stop().unwrap();

    // every snapshot taken was written exactly once
    assert_eq!(summary.samples, source.calls.load(Ordering::SeqCst));
    let lines = read_lines(&path);
    assert_eq!(lines[0], "Time,Module 1,Module 2");
    assert_eq!(lines.len(), 1 + summary.samples * 2);
    let last_values: Vec<_> = lines
        .iter()
        .skip(2)
        .step_by(2)
        .map(|line| line.rsplit(',').next().unwrap().to_string())
        .collect();
    let expected: Vec<_> = (1..=summary.samples).map(|n| n.to_string()).collect();
    assert_eq!(last_values, expected);
}
