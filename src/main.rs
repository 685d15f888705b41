use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod config;
mod monitor;

use commandline::{CliArgs, CliCommands};
use config::MonitorConfig;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    match &args.command {
        CliCommands::ListPorts => {
            let ports =
                bmsmon_lib::serialport::available_ports().with_context(|| "Cannot list ports")?;
            if ports.is_empty() {
                println!("No serial ports found");
            }
            for port in ports {
                println!("{port}");
            }
        }
        CliCommands::Monitor { record, interval } => {
            let mut config = MonitorConfig::from_args(&args)?;
            if let Some(interval) = interval {
                config.record_interval = *interval;
                config.validate()?;
            }
            monitor::run(&config, *record)?;
        }
        CliCommands::Replay {
            capture,
            chunk_size,
            output,
        } => {
            let config = MonitorConfig::from_args(&args)?;
            monitor::replay(&config, capture, *chunk_size, output.as_deref())?;
        }
    }

    Ok(())
}
