use crate::commandline::CliArgs;
use anyhow::{Context, Result};
use bmsmon_lib::matrix::{Geometry, CELLS_PER_MODULE, MODULES};
use bmsmon_lib::measurement::MeasurementMode;
use bmsmon_lib::recorder;
use bmsmon_lib::serialport::{BAUD_RATES, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default = "default_device_name")]
    pub device: String,
    #[serde(default = "MonitorConfig::default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "MonitorConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub mode: MeasurementMode,
    #[serde(
        default = "MonitorConfig::default_record_interval",
        with = "humantime_serde"
    )]
    pub record_interval: Duration,
    #[serde(default = "MonitorConfig::default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "MonitorConfig::default_rows")]
    pub rows: usize,
    #[serde(default = "MonitorConfig::default_columns")]
    pub columns: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device: default_device_name(),
            baud_rate: Self::default_baud_rate(),
            timeout: Self::default_timeout(),
            mode: MeasurementMode::default(),
            record_interval: Self::default_record_interval(),
            output_dir: Self::default_output_dir(),
            rows: Self::default_rows(),
            columns: Self::default_columns(),
        }
    }
}

impl MonitorConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "bmsmon.yaml";

    fn default_baud_rate() -> u32 {
        DEFAULT_BAUD_RATE
    }

    fn default_timeout() -> Duration {
        DEFAULT_TIMEOUT
    }

    fn default_record_interval() -> Duration {
        recorder::DEFAULT_INTERVAL
    }

    fn default_output_dir() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_rows() -> usize {
        CELLS_PER_MODULE
    }

    fn default_columns() -> usize {
        MODULES
    }

    pub fn load(config_file_path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// Loads the configuration file and applies the command line on top of it.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(Self::DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Path::new(Self::DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        if let Some(device) = &args.device {
            config.device = device.clone();
        }
        if let Some(baud_rate) = args.baud {
            config.baud_rate = baud_rate;
        }
        if let Some(mode) = args.mode {
            config.mode = mode;
        }
        if let Some(timeout) = args.timeout {
            config.timeout = timeout;
        }
        if let Some(output_dir) = &args.output_dir {
            config.output_dir = output_dir.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !BAUD_RATES.contains(&self.baud_rate) {
            log::warn!(
                "Unusual baud rate {}, the device usually runs at one of {BAUD_RATES:?}",
                self.baud_rate
            );
        }
        if self.record_interval.is_zero() {
            anyhow::bail!("Recording interval must not be zero");
        }
        self.geometry()?;
        Ok(())
    }

    pub fn geometry(&self) -> Result<Geometry> {
        Geometry::new(self.rows, self.columns).with_context(|| "Invalid matrix size in config")
    }
}
