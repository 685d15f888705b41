//! CSV export of matrix snapshots.
//!
//! Every artifact starts with the header `Time,Module 1,…,Module N`, followed
//! by one record per matrix row and sample. [`export_snapshot`] writes a
//! complete file at once, [`Recording`] appends a sample every interval on its
//! own thread until it is stopped.
//!
//! Recordings do not note the measurement mode: if it changes mid-recording the
//! columns stay the same and only the meaning of the values changes.

use crate::error::{Error, Result};
use crate::matrix::{Geometry, Snapshot};
use crate::session::StreamSession;
use chrono::NaiveDateTime;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

pub const TIME_COLUMN: &str = "Time";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

pub const RECORDING_PREFIX: &str = "data_recording";
pub const EXPORT_PREFIX: &str = "serial_log";

/// Anything that can hand out a consistent copy of the cell matrix.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Result<Snapshot>;
}

impl SnapshotSource for StreamSession {
    fn snapshot(&self) -> Result<Snapshot> {
        StreamSession::snapshot(self)
    }
}

/// Header record: the time column followed by one column per module.
pub fn header(geometry: &Geometry) -> Vec<String> {
    std::iter::once(TIME_COLUMN.to_string())
        .chain(geometry.column_labels())
        .collect()
}

/// `<prefix>_YYYYmmddHHMMSS.csv`
pub fn file_name(prefix: &str, now: NaiveDateTime) -> String {
    format!("{prefix}_{}.csv", now.format("%Y%m%d%H%M%S"))
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// A snapshot stamped with the time it was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: NaiveDateTime,
    pub snapshot: Snapshot,
}

impl Sample {
    /// One record per matrix row: the timestamp followed by the row's values.
    pub fn records(&self) -> impl Iterator<Item = Vec<String>> + '_ {
        let timestamp = self.timestamp.format(TIMESTAMP_FORMAT).to_string();
        self.snapshot.rows().map(move |row| {
            std::iter::once(timestamp.clone())
                .chain(row.iter().map(ToString::to_string))
                .collect()
        })
    }
}

pub fn sample(snapshot: Snapshot, timestamp: NaiveDateTime) -> Sample {
    Sample {
        timestamp,
        snapshot,
    }
}

/// CSV writer for samples of one geometry.
pub struct CsvRecorder<W: io::Write> {
    writer: csv::Writer<W>,
    samples: usize,
}

impl<W: io::Write> CsvRecorder<W> {
    /// Wraps `inner` and writes the header.
    pub fn new(inner: W, geometry: &Geometry) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(inner);
        writer.write_record(header(geometry))?;
        writer.flush()?;
        Ok(Self { writer, samples: 0 })
    }

    /// Appends all rows of `sample` and flushes them, so the artifact stays
    /// readable while the recording is still going.
    pub fn write_sample(&mut self, sample: &Sample) -> Result<()> {
        for record in sample.records() {
            self.writer.write_record(&record)?;
        }
        self.writer.flush()?;
        self.samples += 1;
        Ok(())
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn finish(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|err| Error::Io(err.into_error()))
    }
}

/// Writes `snapshot` as a complete artifact (header and every row) to `path`.
pub fn export_snapshot(path: &Path, snapshot: &Snapshot, timestamp: NaiveDateTime) -> Result<()> {
    let file = File::create(path)?;
    let mut recorder = CsvRecorder::new(file, &snapshot.geometry())?;
    recorder.write_sample(&sample(snapshot.clone(), timestamp))?;
    recorder.finish()?.sync_all()?;
    log::info!("Snapshot exported to {}", path.display());
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub path: PathBuf,
    pub samples: usize,
}

/// Periodic recording running on its own thread.
#[derive(Debug)]
pub struct Recording {
    path: PathBuf,
    stop_tx: mpsc::Sender<()>,
    handle: thread::JoinHandle<Result<RecordingSummary>>,
}

impl Recording {
    /// Creates `path`, writes the header and starts sampling `source` every
    /// `interval`, the first sample being taken right away.
    ///
    /// Ticks follow a fixed schedule: a late tick is written as soon as
    /// possible and the schedule is not shifted, so no tick is lost or doubled.
    /// The recording ends on [`stop`](Self::stop), or on its own once `source`
    /// stops handing out snapshots.
    pub fn start<S>(source: Arc<S>, path: PathBuf, interval: Duration) -> Result<Self>
    where
        S: SnapshotSource + ?Sized + 'static,
    {
        let first = source.snapshot()?;
        let file = File::create(&path)?;
        let mut recorder = CsvRecorder::new(file, &first.geometry())?;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        log::info!("Recording started: {}", path.display());

        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("recorder".into())
            .spawn(move || -> Result<RecordingSummary> {
                let mut snapshot = Ok(first);
                let mut next_tick = Instant::now();
                loop {
                    match snapshot {
                        Ok(snapshot) => recorder.write_sample(&sample(snapshot, now()))?,
                        Err(err) => {
                            log::warn!("Recording stops, no snapshot available: {err}");
                            break;
                        }
                    }
                    next_tick += interval;
                    let wait = next_tick.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(mpsc::RecvTimeoutError::Timeout) => snapshot = source.snapshot(),
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
                let samples = recorder.samples();
                recorder.finish()?.sync_all()?;
                log::info!(
                    "Recording saved as {} ({samples} samples)",
                    thread_path.display()
                );
                Ok(RecordingSummary {
                    path: thread_path,
                    samples,
                })
            })?;

        Ok(Self {
            path,
            stop_tx,
            handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the recording thread already ended on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops sampling and waits until the artifact is flushed and closed.
    /// A sample being written when this is called is completed first.
    pub fn stop(self) -> Result<RecordingSummary> {
        // the thread may have ended already, then nobody listens
        let _ = self.stop_tx.send(());
        self.handle.join().map_err(|_| Error::RecorderPanicked)?
    }
}
