//! Asynchronous transport that feeds a [`StreamSession`] from a serial port
//! using Tokio and the `tokio-serial` crate.
//!
//! The reader task suspends until bytes arrive instead of polling, and stops
//! when the shutdown future resolves.
//!
//! # Example
//!
//! ```no_run
//! use bmsmon_lib::measurement::MeasurementMode;
//! use bmsmon_lib::session::StreamSession;
//! use bmsmon_lib::tokio_serial_async::{Error, SerialMonitor};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Error> {
//!     let session = StreamSession::default();
//!     session.start(MeasurementMode::InstantaneousCellVoltage)?;
//!
//!     let mut monitor = SerialMonitor::new("/dev/ttyUSB0", 9600)?;
//!     let shutdown = tokio::time::sleep(std::time::Duration::from_secs(10));
//!     let bytes = monitor.run(&session, shutdown).await?;
//!     println!("{bytes} bytes, matrix: {:?}", session.snapshot()?);
//!     Ok(())
//! }
//! ```

use crate::session::StreamSession;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Errors specific to the asynchronous transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error from the decoding session, e.g. the session is not active.
    #[error("Session error: {0}")]
    Session(#[from] crate::Error),
    /// An I/O error, typically from the serial port communication.
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    /// An error from the `tokio-serial` crate.
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
}

/// A specialized `Result` type for operations within the `tokio_serial_async` module.
type Result<T> = std::result::Result<T, Error>;

const READ_BUFFER_LENGTH: usize = 1024;

#[derive(Debug)]
pub struct SerialMonitor {
    serial: tokio_serial::SerialStream,
}

impl SerialMonitor {
    /// Opens `port` with 8 data bits, no parity, one stop bit and no flow control.
    pub fn new(port: &str, baud_rate: u32) -> Result<Self> {
        use tokio_serial::SerialPortBuilderExt;

        log::debug!("Open serial port '{port}' with {baud_rate} baud");
        Ok(Self {
            serial: tokio_serial::new(port, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()?,
        })
    }

    /// Feeds received bytes into `session` until `shutdown` resolves.
    /// Returns the number of bytes read.
    pub async fn run<F>(&mut self, session: &StreamSession, shutdown: F) -> Result<u64>
    where
        F: Future<Output = ()>,
    {
        pump(&mut self.serial, session, shutdown).await
    }
}

/// Reads from `reader` and feeds every chunk into `session` in arrival order.
///
/// Ends when `shutdown` resolves, at end of stream, or once the session is no
/// longer active. I/O errors are returned, not retried.
pub async fn pump<R, F>(reader: &mut R, session: &StreamSession, shutdown: F) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    F: Future<Output = ()>,
{
    let mut buffer = vec![0; READ_BUFFER_LENGTH];
    let mut total = 0u64;
    tokio::pin!(shutdown);

    loop {
        let received = tokio::select! {
            biased;
            _ = &mut shutdown => {
                log::debug!("Shutdown requested after {total} bytes");
                break;
            }
            received = reader.read(&mut buffer) => received?,
        };
        if received == 0 {
            log::info!("End of stream after {total} bytes");
            break;
        }
        log::trace!("receive_bytes: {:02X?}", &buffer[..received]);
        total += received as u64;
        match session.feed(&buffer[..received]) {
            Ok(_) => {}
            Err(crate::Error::InvalidState { state, .. }) => {
                log::debug!("Session is {state}, stop reading");
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(total)
}
