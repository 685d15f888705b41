#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bmsmon_lib
//!
//! This crate decodes the ASCII-hex telemetry stream of a battery management
//! system into a live matrix of per-cell readings (rows are the cells of a
//! module, columns are the modules) and exports that matrix as CSV.
//!
//! The core is transport agnostic: bytes go into a [`session::StreamSession`]
//! in chunks of any size, and observers, display code and recorders read it
//! back as snapshots.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `bmsmon` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Transport Features
//! - `serialport`: Enables the **synchronous** reader using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** reader using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for frames, modes and cell values.
//! - `bin-dependencies`: Enables all features required by the `bmsmon` binary executable.

/// Contains error types for the library.
mod error;
/// Cell matrix storage and geometry.
pub mod matrix;
/// Measurement modes and the conversion of raw readings.
pub mod measurement;
/// Wire format and frame scanner.
pub mod protocol;
/// CSV export, on demand and periodic.
pub mod recorder;
pub mod session;

pub use error::{Error, Result};

/// Synchronous serial port reader.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous serial port reader.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
