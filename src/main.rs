//! mqttsensor - Main Entry Point
//!
//! Runs a single sensor from a TOML configuration file and prints every
//! reading as one JSON line on stdout.

use clap::{Parser, Subcommand};
use mqttsensor::observability::init_default_logging;
use mqttsensor::{ConnectAttempt, MqttSensor, ReadMode, ReadOutcome, SensorConfig};
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn, Instrument};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["sensor.toml", "config/sensor.toml"];

/// Single-topic MQTT ingestion sensor
#[derive(Parser)]
#[command(name = "mqttsensor")]
#[command(about = "Subscribe to an MQTT topic and print buffered readings")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and poll readings until interrupted. SIGHUP reloads the configuration.
    Run {
        /// Polling interval in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Read the latest message instead of draining the queue
        #[arg(long)]
        snapshot: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "TRACE" } else { "DEBUG" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting mqttsensor v{}", env!("CARGO_PKG_VERSION"));

    let config_path = match resolve_config_path(cli.config.as_deref()) {
        Some(path) => path,
        None => {
            error!(
                "No configuration file found. Please provide one with -c/--config or create sensor.toml"
            );
            process::exit(1);
        }
    };

    info!("Loading configuration from: {}", config_path.display());
    let config = match SensorConfig::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            interval_ms,
            snapshot,
        } => {
            run_sensor(
                config,
                &config_path,
                Duration::from_millis(interval_ms.max(1)),
                ReadMode::from_capture_flag(!snapshot),
            )
            .await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

async fn run_sensor(
    config: SensorConfig,
    config_path: &Path,
    period: Duration,
    mode: ReadMode,
) -> Result<(), Box<dyn std::error::Error>> {
    let (sensor, attempt) = MqttSensor::new("mqttsensor", config).await?;
    report_connect_outcome(attempt);

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(sensor = sensor.name(), mode = ?mode, "Sensor is running");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sensor.read(mode) {
                    Ok(ReadOutcome::Reading(reading)) => {
                        println!("{}", serde_json::to_string(&reading)?);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Read failed: {}", e),
                }
            }
            _ = sighup.recv() => {
                let span = mqttsensor::lifecycle_span!(event = "reload", path = %config_path.display());
                async {
                    info!("Received SIGHUP, reloading configuration");
                    match SensorConfig::load_from_file(config_path) {
                        Ok(config) => match sensor.reconfigure(config).await {
                            Ok(attempt) => report_connect_outcome(attempt),
                            Err(e) => error!("Reconfigure rejected: {}", e),
                        },
                        Err(e) => error!("Failed to reload configuration, keeping current: {}", e),
                    }
                }
                .instrument(span)
                .await;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
        }
    }

    sensor.close().await;
    Ok(())
}

/// Log the connect outcome of a generation without blocking the read loop
fn report_connect_outcome(attempt: ConnectAttempt) {
    let generation = attempt.generation();
    tokio::spawn(async move {
        match attempt.outcome().await {
            Ok(()) => info!(generation, "Subscribed"),
            Err(e) => warn!(generation, "Connect attempt did not complete: {}", e),
        }
    });
}

fn handle_config_command(
    config: &SensorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
