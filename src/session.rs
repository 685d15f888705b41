//! Live decoding session for one device connection.
//!
//! A [`StreamSession`] owns the scanner tail, the active [`MeasurementMode`]
//! and the [`CellMatrix`]. The transport thread calls [`StreamSession::feed`]
//! with whatever bytes arrived, display and recording threads read copies of
//! the matrix through [`StreamSession::snapshot`] and [`StreamSession::row`],
//! and observers receive one [`MatrixUpdate`] per call that changed cells.

use crate::error::{Error, Result};
use crate::matrix::{CellCoordinate, CellMatrix, Geometry, Snapshot};
use crate::measurement::{CellValue, MeasurementMode};
use crate::protocol::{self, MARKER};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Cells whose value changed during a single `feed` or mode switch.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixUpdate {
    /// Mode the new values were decoded with.
    pub mode: MeasurementMode,
    pub changed: Vec<CellCoordinate>,
}

impl MatrixUpdate {
    /// Distinct matrix rows touched by this update, ascending.
    pub fn rows(&self) -> BTreeSet<usize> {
        self.changed.iter().map(|coord| coord.row).collect()
    }
}

enum Inner {
    Idle,
    Active {
        mode: MeasurementMode,
        matrix: CellMatrix,
    },
    Closed,
}

impl Inner {
    fn state(&self) -> SessionState {
        match self {
            Inner::Idle => SessionState::Idle,
            Inner::Active { .. } => SessionState::Active,
            Inner::Closed => SessionState::Closed,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StreamSession {
    geometry: Geometry,
    marker: Vec<u8>,
    // Unconsumed bytes of a frame straddling two chunks. Never locked while holding `inner`.
    pending: Mutex<Vec<u8>>,
    inner: Mutex<Inner>,
    decode_errors: AtomicU64,
    // Locked while holding `inner` when publishing.
    subscribers: Mutex<Vec<mpsc::Sender<MatrixUpdate>>>,
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("geometry", &self.geometry)
            .field("marker", &String::from_utf8_lossy(&self.marker))
            .field("state", &self.state())
            .field("decode_errors", &self.decode_errors())
            .finish()
    }
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new(Geometry::default())
    }
}

impl StreamSession {
    pub fn new(geometry: Geometry) -> Self {
        Self::with_marker(geometry, MARKER)
    }

    pub fn with_marker(geometry: Geometry, marker: &[u8]) -> Self {
        Self {
            geometry,
            marker: marker.to_vec(),
            pending: Mutex::new(Vec::new()),
            inner: Mutex::new(Inner::Idle),
            decode_errors: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state()
    }

    /// Active measurement mode, `None` unless the session is active.
    pub fn mode(&self) -> Option<MeasurementMode> {
        match &*lock(&self.inner) {
            Inner::Active { mode, .. } => Some(*mode),
            _ => None,
        }
    }

    /// Number of frames dropped because they could not be decoded or addressed.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Registers an observer. The channel disconnects when the session stops.
    pub fn subscribe(&self) -> mpsc::Receiver<MatrixUpdate> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    fn publish(&self, update: &MatrixUpdate) {
        lock(&self.subscribers).retain(|tx| tx.send(update.clone()).is_ok());
    }

    pub fn start(&self, mode: MeasurementMode) -> Result<()> {
        let mut pending = lock(&self.pending);
        let mut inner = lock(&self.inner);
        if !matches!(*inner, Inner::Idle) {
            return Err(Error::InvalidState {
                operation: "start",
                state: inner.state(),
            });
        }
        pending.clear();
        *inner = Inner::Active {
            mode,
            matrix: CellMatrix::new(self.geometry),
        };
        log::info!("Session started in mode '{mode}'");
        Ok(())
    }

    /// Switches the measurement mode and clears the matrix.
    ///
    /// Returns `false` if `mode` was already active. Bytes of a partially
    /// received frame are kept and decoded with the new mode.
    pub fn set_mode(&self, mode: MeasurementMode) -> Result<bool> {
        let mut inner = lock(&self.inner);
        let Inner::Active {
            mode: current,
            matrix,
        } = &mut *inner
        else {
            return Err(Error::InvalidState {
                operation: "set_mode",
                state: inner.state(),
            });
        };
        if *current == mode {
            return Ok(false);
        }
        log::info!("Measurement mode changed from '{current}' to '{mode}'");
        let cleared = matrix.known();
        matrix.reset();
        *current = mode;
        let update = MatrixUpdate {
            mode,
            changed: cleared,
        };
        if !update.changed.is_empty() {
            self.publish(&update);
        }
        Ok(true)
    }

    /// Decodes `bytes` and applies every complete frame to the matrix.
    ///
    /// Chunks may split frames anywhere, but they must be fed in the order
    /// they were received: reordered chunks are not detected and produce
    /// garbage or lost frames. Malformed frames and out-of-range cell ids are
    /// counted in [`decode_errors`](Self::decode_errors) and skipped.
    ///
    /// Returns the cells that changed, `None` if nothing changed.
    pub fn feed(&self, bytes: &[u8]) -> Result<Option<MatrixUpdate>> {
        let mut pending = lock(&self.pending);
        if let state @ (SessionState::Idle | SessionState::Closed) = self.state() {
            return Err(Error::InvalidState {
                operation: "feed",
                state,
            });
        }

        pending.extend_from_slice(bytes);
        let outcome = protocol::scan(&pending, &self.marker);
        pending.drain(..outcome.consumed);
        let mut rejected = outcome.errors.len() as u64;

        let update = {
            let mut inner = lock(&self.inner);
            // `stop` may have closed the session while we were scanning
            let Inner::Active { mode, matrix } = &mut *inner else {
                return Err(Error::InvalidState {
                    operation: "feed",
                    state: inner.state(),
                });
            };
            let mut changed = Vec::new();
            for frame in &outcome.frames {
                match self.geometry.locate(frame.cell_id) {
                    Ok(coord) => {
                        let value: CellValue = mode.decode(&frame.fields);
                        if matrix.set(coord, value) {
                            log::trace!("Cell {coord:?} = {value}");
                            changed.push(coord);
                        }
                    }
                    Err(err) => {
                        log::debug!("Skipping frame: {err}");
                        rejected += 1;
                    }
                }
            }
            let update = MatrixUpdate {
                mode: *mode,
                changed,
            };
            // published under the lock, so nothing is delivered once `stop` returns
            if !update.changed.is_empty() {
                self.publish(&update);
            }
            update
        };

        if rejected > 0 {
            let total = self.decode_errors.fetch_add(rejected, Ordering::Relaxed) + rejected;
            log::debug!("{rejected} frame(s) rejected, {total} in total");
        }
        if update.changed.is_empty() {
            return Ok(None);
        }
        Ok(Some(update))
    }

    /// Closes the session and discards the matrix and scanner state.
    ///
    /// Safe to call while another thread is inside `feed`: once this returns,
    /// no further update reaches the matrix. Stopping a closed session does nothing.
    pub fn stop(&self) {
        {
            let mut inner = lock(&self.inner);
            if matches!(*inner, Inner::Closed) {
                return;
            }
            *inner = Inner::Closed;
        }
        lock(&self.subscribers).clear();
        lock(&self.pending).clear();
        log::info!(
            "Session closed, {} frame(s) rejected",
            self.decode_errors()
        );
    }

    /// Copy of the whole matrix.
    pub fn snapshot(&self) -> Result<Snapshot> {
        match &*lock(&self.inner) {
            Inner::Active { matrix, .. } => Ok(matrix.snapshot()),
            other => Err(Error::InvalidState {
                operation: "snapshot",
                state: other.state(),
            }),
        }
    }

    /// Copy of one matrix row, one value per module.
    pub fn row(&self, row: usize) -> Result<Vec<CellValue>> {
        match &*lock(&self.inner) {
            Inner::Active { matrix, .. } => matrix
                .row(row)
                .map(<[CellValue]>::to_vec)
                .ok_or(Error::RowOutOfRange {
                    row,
                    rows: self.geometry.rows(),
                }),
            other => Err(Error::InvalidState {
                operation: "row",
                state: other.state(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, RawFields};

    fn wire(cell_id: u8, instant_voltage: u16, resistance: u16, ocv: u16) -> Vec<u8> {
        Frame {
            cell_id,
            fields: RawFields {
                instant_voltage,
                resistance,
                open_circuit_voltage: ocv,
            },
        }
        .to_wire()
    }

    fn coord(row: usize, column: usize) -> CellCoordinate {
        CellCoordinate { row, column }
    }

    fn active_session() -> StreamSession {
        let session = StreamSession::default();
        session.start(MeasurementMode::InstantaneousCellVoltage).unwrap();
        session
    }

    #[test]
    fn lifecycle() {
        let session = StreamSession::default();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(
            session.feed(b"t0368"),
            Err(Error::InvalidState {
                operation: "feed",
                state: SessionState::Idle
            })
        ));
        assert!(session.set_mode(MeasurementMode::OpenCircuitVoltage).is_err());
        assert!(session.snapshot().is_err());

        session.start(MeasurementMode::InternalResistance).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.mode(), Some(MeasurementMode::InternalResistance));
        assert!(matches!(
            session.start(MeasurementMode::InternalResistance),
            Err(Error::InvalidState {
                operation: "start",
                state: SessionState::Active
            })
        ));

        session.stop();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.mode(), None);
        assert!(matches!(
            session.feed(&wire(0, 0, 0, 0)),
            Err(Error::InvalidState {
                operation: "feed",
                state: SessionState::Closed
            })
        ));
        assert!(session.start(MeasurementMode::InternalResistance).is_err());
        // stopping twice is harmless
        session.stop();
    }

    #[test]
    fn feed_updates_matrix() {
        let session = active_session();
        let mut bytes = wire(13, 0, 0, 0);
        bytes.extend(wire(95, 0xFFFF, 0, 0));
        let update = session.feed(&bytes).unwrap().unwrap();
        assert_eq!(update.changed, vec![coord(1, 1), coord(11, 7)]);
        assert_eq!(update.mode, MeasurementMode::InstantaneousCellVoltage);
        assert_eq!(update.rows().into_iter().collect::<Vec<_>>(), vec![1, 11]);

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.get(coord(1, 1)), CellValue::Volts(1.5));
        assert_eq!(snapshot.get(coord(11, 7)), CellValue::Volts(11.33));
        assert_eq!(session.row(1).unwrap()[1], CellValue::Volts(1.5));
        assert!(matches!(
            session.row(12),
            Err(Error::RowOutOfRange { row: 12, rows: 12 })
        ));
        assert_eq!(session.row(11).unwrap().len(), 8);
    }

    #[test]
    fn unchanged_values_are_not_reported() {
        let session = active_session();
        assert!(session.feed(&wire(5, 100, 0, 0)).unwrap().is_some());
        assert_eq!(session.feed(&wire(5, 100, 0, 0)).unwrap(), None);

        // same cell twice in one chunk, only reported once per change
        let mut bytes = wire(5, 200, 0, 0);
        bytes.extend(wire(5, 100, 0, 0));
        let update = session.feed(&bytes).unwrap().unwrap();
        assert_eq!(update.changed, vec![coord(5, 0)]);
    }

    #[test]
    fn frame_split_across_feeds() {
        let frame = wire(42, 0x1234, 0x0FA0, 0x0BB8);
        let whole = active_session();
        whole.feed(&frame).unwrap();

        for split in 1..frame.len() {
            let session = active_session();
            assert_eq!(session.feed(&frame[..split]).unwrap(), None);
            let update = session.feed(&frame[split..]).unwrap().unwrap();
            assert_eq!(update.changed, vec![coord(6, 3)]);
            assert_eq!(session.snapshot().unwrap(), whole.snapshot().unwrap());
        }
    }

    #[test]
    fn byte_by_byte_feed() {
        let session = active_session();
        let mut stream = b"\r\n".to_vec();
        stream.extend(wire(0, 1, 2, 3));
        stream.extend(b"noise");
        stream.extend(wire(1, 4, 5, 6));
        let mut updates = 0;
        for byte in &stream {
            if session.feed(std::slice::from_ref(byte)).unwrap().is_some() {
                updates += 1;
            }
        }
        assert_eq!(updates, 2);
        assert_eq!(session.snapshot().unwrap().values()[..1], [CellValue::Volts(1.5)]);
    }

    #[test]
    fn decode_errors_are_counted_not_fatal() {
        let session = active_session();
        let mut bytes = b"t0368ZZ000000000000".to_vec();
        bytes.extend(wire(96, 0, 0, 0));
        bytes.extend(wire(200, 0, 0, 0));
        bytes.extend(wire(2, 0, 0, 0));
        let update = session.feed(&bytes).unwrap().unwrap();
        assert_eq!(update.changed, vec![coord(2, 0)]);
        assert_eq!(session.decode_errors(), 3);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn mode_switch_resets_matrix() {
        let session = active_session();
        let frame = wire(13, 0x0100, 0x0200, 0x0300);
        session.feed(&frame).unwrap();

        assert!(!session
            .set_mode(MeasurementMode::InstantaneousCellVoltage)
            .unwrap());
        assert!(session
            .set_mode(MeasurementMode::InternalResistance)
            .unwrap());
        let snapshot = session.snapshot().unwrap();
        assert!(snapshot.values().iter().all(|v| !v.is_known()));

        // the same frame counts as a change again
        let update = session.feed(&frame).unwrap().unwrap();
        assert_eq!(update.changed, vec![coord(1, 1)]);
        assert_eq!(update.mode, MeasurementMode::InternalResistance);
        assert_eq!(
            session.snapshot().unwrap().get(coord(1, 1)),
            CellValue::Raw(0x0200)
        );
    }

    #[test]
    fn mode_switch_keeps_partial_frame() {
        let session = active_session();
        let frame = wire(1, 0x0001, 0x0002, 0x0003);
        session.feed(&frame[..10]).unwrap();
        session.set_mode(MeasurementMode::OpenCircuitVoltage).unwrap();
        session.feed(&frame[10..]).unwrap();
        assert_eq!(
            session.snapshot().unwrap().get(coord(1, 0)),
            CellValue::Raw(3)
        );
    }

    #[test]
    fn observers_get_one_batch_per_feed() {
        let session = active_session();
        let rx = session.subscribe();
        let mut bytes = wire(0, 1, 0, 0);
        bytes.extend(wire(1, 1, 0, 0));
        bytes.extend(wire(2, 1, 0, 0));
        session.feed(&bytes).unwrap();
        session.feed(&bytes).unwrap();
        session.set_mode(MeasurementMode::OpenCircuitVoltage).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.changed.len(), 3);
        let reset = rx.try_recv().unwrap();
        assert_eq!(reset.mode, MeasurementMode::OpenCircuitVoltage);
        assert_eq!(reset.changed.len(), 3);
        assert!(rx.try_recv().is_err());

        session.stop();
        assert!(matches!(
            rx.recv(),
            Err(mpsc::RecvError)
        ));
    }

    #[test]
    fn snapshot_is_idempotent() {
        let session = active_session();
        session.feed(&wire(7, 7, 7, 7)).unwrap();
        assert_eq!(session.snapshot().unwrap(), session.snapshot().unwrap());
    }

    #[test]
    fn stop_during_feed_applies_nothing() {
        use std::sync::Arc;

        let session = Arc::new(active_session());
        let updates = session.subscribe();
        let feeder = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                let frames = [wire(3, 0, 0, 0), wire(3, 0xFFFF, 0, 0)];
                let mut published = 0;
                for frame in frames.iter().cycle() {
                    match session.feed(frame) {
                        Ok(Some(_)) => published += 1,
                        Ok(None) => panic!("every frame changes the cell"),
                        Err(Error::InvalidState { .. }) => break,
                        Err(err) => panic!("unexpected error {err}"),
                    }
                }
                published
            })
        };
        // let the feeder get going
        let first = updates.recv().unwrap();
        assert_eq!(first.changed, vec![coord(3, 0)]);
        session.stop();
        assert_eq!(session.state(), SessionState::Closed);

        // the channel is disconnected by `stop`, so this drains and ends
        let received = 1 + updates.iter().count();
        let published = feeder.join().unwrap();
        assert_eq!(received, published);
        assert!(updates.try_recv().is_err());
        assert!(session.snapshot().is_err());
    }

    #[test]
    fn custom_geometry_and_marker() {
        let session = StreamSession::with_marker(Geometry::new(2, 2).unwrap(), b"##");
        session.start(MeasurementMode::InternalResistance).unwrap();
        let update = session.feed(b"##03000000090000##04000000010000").unwrap().unwrap();
        assert_eq!(update.changed, vec![coord(1, 1)]);
        assert_eq!(session.decode_errors(), 1);
    }
}
