use crate::session::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operation was invoked in a session state that does not allow it.
    #[error("'{operation}' is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("Invalid matrix geometry {rows}x{columns}, at most 256 cells are addressable")]
    InvalidGeometry { rows: usize, columns: usize },
    #[error("Row {row} is outside of the matrix, which has {rows} rows")]
    RowOutOfRange { row: usize, rows: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Failure while writing an export artifact.
    #[error("Export error: {0}")]
    Export(#[from] csv::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Recording thread panicked")]
    RecorderPanicked,
}

pub type Result<T> = std::result::Result<T, Error>;
