use crate::config::MonitorConfig;
use anyhow::{bail, Context, Result};
use bmsmon_lib::matrix::Snapshot;
use bmsmon_lib::measurement::{CellValue, MeasurementMode};
use bmsmon_lib::recorder::{self, Recording};
use bmsmon_lib::serialport::SerialMonitor;
use bmsmon_lib::session::StreamSession;
use log::{error, info, warn};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const COLUMN_WIDTH: usize = 10;

fn render_header(columns: usize) -> String {
    let labels: String = (1..=columns)
        .map(|i| format!("{:>COLUMN_WIDTH$}", format!("Module {i}")))
        .collect();
    format!("{:<8}{labels}", "")
}

fn render_row(row: usize, values: &[CellValue]) -> String {
    let values: String = values
        .iter()
        .map(|value| format!("{:>COLUMN_WIDTH$}", value.to_string()))
        .collect();
    format!("Cell {:<3}{values}", row + 1)
}

fn print_matrix(mode: Option<MeasurementMode>, snapshot: &Snapshot) {
    if let Some(mode) = mode {
        println!("--- {mode} ---");
    }
    println!("{}", render_header(snapshot.geometry().columns()));
    for (row, values) in snapshot.rows().enumerate() {
        println!("{}", render_row(row, values));
    }
}

enum Command {
    Mode(MeasurementMode),
    Record,
    Export,
    Show,
    Stats,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    let (word, argument) = line.split_once(' ').unwrap_or((line, ""));
    Ok(Some(match word.to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "mode" => Command::Mode(argument.parse()?),
        "record" => Command::Record,
        "export" => Command::Export,
        "show" => Command::Show,
        "stats" => Command::Stats,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => bail!("Unknown command '{other}', try 'help'"),
    }))
}

const HELP: &str = "\
Commands:
  mode <icv|ir|ocv>  switch the measurement shown in the matrix
  record             start or stop a periodic CSV recording
  export             write the current matrix to a CSV file
  show               print the whole matrix
  stats              print session statistics
  quit               disconnect and exit";

fn output_path(config: &MonitorConfig, prefix: &str) -> PathBuf {
    config.output_dir.join(recorder::file_name(
        prefix,
        chrono::Local::now().naive_local(),
    ))
}

fn start_recording(session: &Arc<StreamSession>, config: &MonitorConfig) -> Result<Recording> {
    let path = output_path(config, recorder::RECORDING_PREFIX);
    let recording = Recording::start(Arc::clone(session), path.clone(), config.record_interval)
        .with_context(|| format!("Cannot start recording to {path:?}"))?;
    println!("Recording started: {}", path.display());
    Ok(recording)
}

fn stop_recording(recording: Recording) {
    match recording.stop() {
        Ok(summary) => println!(
            "Recording saved as: {} ({} samples)",
            summary.path.display(),
            summary.samples
        ),
        Err(e) => error!("Recording failed: {e}"),
    }
}

fn export(session: &StreamSession, config: &MonitorConfig) -> Result<PathBuf> {
    let path = output_path(config, recorder::EXPORT_PREFIX);
    let snapshot = session.snapshot()?;
    recorder::export_snapshot(&path, &snapshot, chrono::Local::now().naive_local())
        .with_context(|| format!("Cannot export CSV to {path:?}"))?;
    Ok(path)
}

/// Why the serial reader ended, `None` if it was asked to stop.
fn reader_end_reason(result: &bmsmon_lib::Result<u64>, requested: bool) -> Option<String> {
    match result {
        Err(e) => Some(format!("Serial connection lost: {e}")),
        Ok(_) if !requested => Some("Serial port closed".to_string()),
        Ok(_) => None,
    }
}

pub fn run(config: &MonitorConfig, record: bool) -> Result<()> {
    info!("Starting monitor: {config:?}");
    let mut serial = SerialMonitor::new(&config.device, config.baud_rate)
        .with_context(|| format!("Cannot open serial port '{}'", config.device))?;
    serial.set_timeout(config.timeout)?;

    let session = Arc::new(StreamSession::new(config.geometry()?));
    session.start(config.mode)?;
    println!("Connected to {} at {} baud", config.device, config.baud_rate);

    let running = Arc::new(AtomicBool::new(true));
    let reader = {
        let session = Arc::clone(&session);
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || {
                let result = serial.run(&session, &running);
                let requested = !running.load(Ordering::Acquire);
                if let Some(reason) = reader_end_reason(&result, requested) {
                    error!("{reason}, press enter to exit");
                }
                // nothing will arrive any more, end the display as well
                session.stop();
                result
            })?
    };

    let display = {
        let session = Arc::clone(&session);
        let updates = session.subscribe();
        thread::Builder::new()
            .name("display".into())
            .spawn(move || {
                for update in updates {
                    for row in update.rows() {
                        if let Ok(values) = session.row(row) {
                            println!("{}", render_row(row, &values));
                        }
                    }
                }
            })?
    };

    let mut recording = if record {
        Some(start_recording(&session, config)?)
    } else {
        None
    };

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if reader.is_finished() {
            warn!("Serial reader stopped");
            break;
        }
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        match command {
            Command::Mode(mode) => match session.set_mode(mode) {
                Ok(true) => println!("Measurement mode: {mode}"),
                Ok(false) => println!("Already showing {mode}"),
                Err(e) => error!("Cannot change mode: {e}"),
            },
            Command::Record => match recording.take() {
                Some(active) => stop_recording(active),
                None => match start_recording(&session, config) {
                    Ok(started) => recording = Some(started),
                    Err(e) => error!("{e:#}"),
                },
            },
            Command::Export => match export(&session, config) {
                Ok(path) => println!("Log exported as CSV: {}", path.display()),
                Err(e) => error!("{e:#}"),
            },
            Command::Show => match session.snapshot() {
                Ok(snapshot) => print_matrix(session.mode(), &snapshot),
                Err(e) => error!("{e}"),
            },
            Command::Stats => println!(
                "Mode: {}, state: {}, rejected frames: {}, recording: {}",
                session
                    .mode()
                    .map_or_else(|| "-".to_string(), |mode| mode.to_string()),
                session.state(),
                session.decode_errors(),
                recording
                    .as_ref()
                    .map_or_else(|| "off".to_string(), |r| r.path().display().to_string())
            ),
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
        }
    }

    if let Some(active) = recording.take() {
        stop_recording(active);
    }
    running.store(false, Ordering::Release);
    session.stop();
    println!("Disconnected");

    let _ = display.join();
    match reader.join() {
        Ok(result) => {
            let bytes = result.with_context(|| "Serial connection failed")?;
            info!("Read {bytes} bytes, {} frames rejected", session.decode_errors());
            Ok(())
        }
        Err(_) => bail!("Serial reader thread panicked"),
    }
}

/// Feeds a captured byte stream through a fresh session and prints the result.
pub fn replay(
    config: &MonitorConfig,
    capture: &Path,
    chunk_size: usize,
    output: Option<&Path>,
) -> Result<()> {
    if chunk_size == 0 {
        bail!("Chunk size must not be zero");
    }
    let bytes = std::fs::read(capture).with_context(|| format!("Cannot read {capture:?}"))?;
    let session = StreamSession::new(config.geometry()?);
    session.start(config.mode)?;

    let mut updates = 0usize;
    for chunk in bytes.chunks(chunk_size) {
        if session.feed(chunk)?.is_some() {
            updates += 1;
        }
    }
    let snapshot = session.snapshot()?;
    print_matrix(session.mode(), &snapshot);
    println!(
        "{} bytes, {updates} updates, {} frames rejected",
        bytes.len(),
        session.decode_errors()
    );

    if let Some(output) = output {
        recorder::export_snapshot(output, &snapshot, chrono::Local::now().naive_local())
            .with_context(|| format!("Cannot export CSV to {output:?}"))?;
        println!("Log exported as CSV: {}", output.display());
    }
    session.stop();
    Ok(())
}
