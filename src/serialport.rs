use crate::error::{Error, Result};
use crate::session::StreamSession;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const BAUD_RATES: [u32; 5] = [2400, 4800, 9600, 14400, 115200];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const READ_BUFFER_LENGTH: usize = 1024;

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|port| port.port_name)
        .collect())
}

/// Blocking reader that pumps a serial port into a [`StreamSession`].
pub struct SerialMonitor {
    serial: Box<dyn serialport::SerialPort>,
}

impl std::fmt::Debug for SerialMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialMonitor")
            .field("port", &self.serial.name())
            .finish()
    }
}

impl SerialMonitor {
    pub fn new(port: &str, baud_rate: u32) -> Result<Self> {
        log::debug!("Open serial port '{port}' with {baud_rate} baud");
        Ok(Self {
            serial: serialport::new(port, baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(DEFAULT_TIMEOUT)
                .open()?,
        })
    }

    /// Upper bound for a single blocking read, also how long it takes `run`
    /// to notice that `running` was cleared.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        log::trace!("set timeout to {timeout:?}");
        Ok(self.serial.set_timeout(timeout)?)
    }

    /// Feeds received bytes into `session` until `running` is cleared, the
    /// session is closed or the port is gone. Returns the number of bytes read.
    pub fn run(&mut self, session: &StreamSession, running: &AtomicBool) -> Result<u64> {
        pump(&mut self.serial, session, running)
    }
}

/// Reads from `reader` and feeds every chunk into `session` in arrival order.
///
/// Read timeouts are not errors, the loop just checks `running` again. End of
/// stream and a closed session end the loop, any other I/O error is returned.
pub fn pump<R: Read + ?Sized>(
    reader: &mut R,
    session: &StreamSession,
    running: &AtomicBool,
) -> Result<u64> {
    let mut buffer = vec![0; READ_BUFFER_LENGTH];
    let mut total = 0u64;
    while running.load(Ordering::Acquire) {
        let received = match reader.read(&mut buffer) {
            Ok(0) => {
                log::info!("End of stream after {total} bytes");
                break;
            }
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(err) => return Err(err.into()),
        };
        log::trace!("receive_bytes: {:02X?}", &buffer[..received]);
        total += received as u64;
        match session.feed(&buffer[..received]) {
            Ok(_) => {}
            Err(Error::InvalidState { state, .. }) => {
                log::debug!("Session is {state}, stop reading");
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}
