use bmsmon_lib::measurement::MeasurementMode;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// List the serial ports available on this machine
    ListPorts,
    /// Show the live cell matrix and accept commands on stdin
    /// (mode <name>, record, export, show, stats, help, quit)
    Monitor {
        /// Start a periodic CSV recording right away
        #[arg(long, short, action)]
        record: bool,
        /// Sampling interval of periodic recordings (e.g. "1s", "500ms")
        #[arg(long, short, value_parser = humantime::parse_duration)]
        interval: Option<Duration>,
    },
    /// Decode a captured byte stream from a file and print the resulting matrix
    Replay {
        /// File holding raw bytes as received from the device
        capture: PathBuf,
        /// Feed the capture in chunks of this many bytes
        #[arg(long, default_value_t = 64)]
        chunk_size: usize,
        /// Export the final matrix to this CSV file
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

const fn about_text() -> &'static str {
    "battery cell telemetry monitor"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Configuration file, "bmsmon.yaml" in the working directory is used if present
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Baud rate of the serial port (2400, 4800, 9600, 14400 or 115200)
    #[arg(short, long)]
    pub baud: Option<u32>,

    /// Measurement shown in the matrix: icv, ir or ocv
    #[arg(short, long)]
    pub mode: Option<MeasurementMode>,

    /// Timeout of a single serial read (e.g., "100ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub timeout: Option<Duration>,

    /// Directory for recordings and exports
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommands,
}
