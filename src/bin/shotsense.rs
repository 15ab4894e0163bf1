//! shotsense CLI - Command-line interface for the shot segmentation pipeline
//!
//! Commands:
//! - run: Stream a live serial device, printing notifications as NDJSON
//! - replay: Feed a captured line log through the same pipeline
//! - ports: List serial ports
//! - config: Print the default configuration or check a config file

use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use shotsense::ingest::{list_ports, FrameSource, ReaderSource};
use shotsense::notify::Notification;
use shotsense::{PipelineConfig, PipelineError, PipelineService, SHOTSENSE_VERSION};

/// shotsense - Dual-IMU shot segmentation and button-label alignment
#[derive(Parser)]
#[command(name = "shotsense")]
#[command(version = SHOTSENSE_VERSION)]
#[command(about = "Detect and label shots from a dual-IMU serial stream", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream a live device until Ctrl-C
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Serial port (overrides the config file)
        #[arg(short, long)]
        port: Option<String>,

        /// Baud rate (overrides the config file)
        #[arg(short, long)]
        baud: Option<u32>,

        /// Run gyro calibration for this many seconds right after connecting
        #[arg(long)]
        calibrate: Option<f64>,
    },

    /// Replay a captured line log (use - for stdin)
    Replay {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Only print segment and label messages
        #[arg(long)]
        events_only: bool,
    },

    /// List serial ports on this host
    Ports {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration, or validate a file
    Config {
        /// Configuration file to validate
        #[arg(long)]
        check: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), ShotCliError> {
    match cli.command {
        Commands::Run {
            config,
            port,
            baud,
            calibrate,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.serial.port = port;
            }
            if let Some(baud) = baud {
                config.serial.baud_rate = baud;
            }
            config.validate()?;
            cmd_run(config, calibrate)
        }

        Commands::Replay {
            input,
            config,
            events_only,
        } => cmd_replay(load_config(config.as_deref())?, &input, events_only),

        Commands::Ports { json } => cmd_ports(json),

        Commands::Config { check } => cmd_config(check.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ShotCliError> {
    match path {
        Some(path) => Ok(PipelineConfig::load_from_file(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn cmd_run(config: PipelineConfig, calibrate: Option<f64>) -> Result<(), ShotCliError> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(stream_live(config, calibrate))
}

async fn stream_live(config: PipelineConfig, calibrate: Option<f64>) -> Result<(), ShotCliError> {
    let mut service = PipelineService::new(config)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    service.attach_notifications(tx.clone())?;
    service.start_serial()?;

    if let Some(seconds) = calibrate {
        let target = service.start_calibration(seconds)?;
        log::info!("Keep the device still: calibrating over {target} samples");
    }

    let stats_task = service.spawn_stats_task(tx);
    let mut link_check = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut stdout = io::stdout();
    let outcome: Result<(), ShotCliError> = loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => {
                    writeln!(stdout, "{}", message.to_json()?)?;
                    stdout.flush()?;
                }
                None => break Ok(()),
            },
            _ = link_check.tick() => {
                if service.ingest_finished() {
                    break service.wait().map_err(ShotCliError::from);
                }
            }
            _ = &mut ctrl_c => {
                log::info!("Interrupted");
                break Ok(());
            }
        }
    };

    stats_task.abort();
    if service.is_running() {
        service.stop()?;
    }
    outcome
}

fn cmd_replay(config: PipelineConfig, input: &Path, events_only: bool) -> Result<(), ShotCliError> {
    let source: Box<dyn FrameSource> = if input.as_os_str() == "-" {
        Box::new(ReaderSource::new(BufReader::new(io::stdin()), "stdin"))
    } else {
        let file = File::open(input)?;
        Box::new(ReaderSource::new(
            BufReader::new(file),
            input.display().to_string(),
        ))
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let mut stdout = io::stdout().lock();
    runtime.block_on(replay(config, source, &mut stdout, events_only))
}

/// Run a finite source to its end, writing notifications as they arrive
async fn replay<W: Write>(
    config: PipelineConfig,
    source: Box<dyn FrameSource>,
    out: &mut W,
    events_only: bool,
) -> Result<(), ShotCliError> {
    let mut service = PipelineService::new(config)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    service.attach_notifications(tx)?;
    service.start(source)?;

    let write = |out: &mut W, message: Notification| -> Result<(), ShotCliError> {
        if !(events_only && matches!(message, Notification::Sample { .. })) {
            writeln!(out, "{}", message.to_json()?)?;
        }
        Ok(())
    };

    let mut end_check = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            Some(message) = rx.recv() => write(out, message)?,
            _ = end_check.tick() => {
                if service.ingest_finished() {
                    break;
                }
            }
        }
    }
    service.wait()?;
    while let Ok(message) = rx.try_recv() {
        write(out, message)?;
    }

    let summary = Notification::Stat {
        data: service.stats_snapshot(),
    };
    writeln!(out, "{}", summary.to_json()?)?;
    out.flush()?;
    Ok(())
}

fn cmd_ports(json: bool) -> Result<(), ShotCliError> {
    let ports = list_ports()?;

    if json || !atty::is(atty::Stream::Stdout) {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in &ports {
        match &port.description {
            Some(description) => println!("  {} [{}] {}", port.name, port.kind, description),
            None => println!("  {} [{}]", port.name, port.kind),
        }
    }
    Ok(())
}

fn cmd_config(check: Option<&Path>) -> Result<(), ShotCliError> {
    match check {
        Some(path) => {
            let config = PipelineConfig::load_from_file(path)?;
            println!(
                "{}: ok ({} @ {} baud, buffer {} samples)",
                path.display(),
                config.serial.port,
                config.serial.baud_rate,
                config.buffer_capacity()
            );
        }
        None => print!("{}", PipelineConfig::default().to_toml()?),
    }
    Ok(())
}

// Error types

#[derive(Debug)]
enum ShotCliError {
    Io(io::Error),
    Pipeline(PipelineError),
    Json(serde_json::Error),
}

impl From<io::Error> for ShotCliError {
    fn from(e: io::Error) -> Self {
        ShotCliError::Io(e)
    }
}

impl From<PipelineError> for ShotCliError {
    fn from(e: PipelineError) -> Self {
        ShotCliError::Pipeline(e)
    }
}

impl From<serde_json::Error> for ShotCliError {
    fn from(e: serde_json::Error) -> Self {
        ShotCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<ShotCliError> for CliError {
    fn from(e: ShotCliError) -> Self {
        match e {
            ShotCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            ShotCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            ShotCliError::Pipeline(e) => {
                let (code, hint) = match &e {
                    PipelineError::Transport { .. } => (
                        "TRANSPORT_ERROR",
                        Some("Run 'shotsense ports' and check the port name and permissions"),
                    ),
                    PipelineError::Stream(_) => {
                        ("STREAM_ERROR", Some("Check the device cable and power"))
                    }
                    PipelineError::Config(_) => (
                        "CONFIG_ERROR",
                        Some("Run 'shotsense config' for a valid starting point"),
                    ),
                    PipelineError::InvalidCalibration(_) => (
                        "CALIBRATION_ERROR",
                        Some("Use a positive duration of at least one sample period"),
                    ),
                    _ => ("PIPELINE_ERROR", None),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    /// Quiet device, a 500 ms burst at 80 °/s, then a button press
    fn capture() -> String {
        (0..400)
            .map(|i| {
                let t_ms = i * 10;
                let gyro = if (1000..1500).contains(&t_ms) { 80 * 131 } else { 0 };
                let button = u8::from((2410..2460).contains(&t_ms));
                format!(
                    "{i},{t_ms},{button},0,0,16384,{gyro},0,0,0,0,16384,{gyro},0,0\n"
                )
            })
            .collect()
    }

    fn replay_capture(events_only: bool) -> Vec<serde_json::Value> {
        let mut config = PipelineConfig::default();
        config.segmenter.adaptive = false;
        let source = Box::new(ReaderSource::new(Cursor::new(capture().into_bytes()), "capture"));

        let mut out = Vec::new();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime
            .block_on(replay(config, source, &mut out, events_only))
            .unwrap();

        String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_replay_events_only() {
        let messages = replay_capture(true);
        let kinds: Vec<&str> = messages
            .iter()
            .map(|m| m["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["segment", "segment", "label", "stat"]);
        assert_eq!(messages[0]["event"], "start");
        assert_eq!(messages[1]["event"], "end");
        assert_eq!(messages[2]["data"]["segment_id"], messages[1]["data"]["id"]);
        assert_eq!(messages[3]["data"]["total_rx"], 400);
    }

    #[test]
    fn test_replay_streams_decimated_samples() {
        let messages = replay_capture(false);
        let samples = messages.iter().filter(|m| m["type"] == "sample").count();
        // 4 s of 100 Hz data at the default 30 Hz display rate
        assert_eq!(samples, 100);
        assert_eq!(messages.last().unwrap()["type"], "stat");
    }
}
