//! Pulsecast Server - PulseAudio to Chromecast bridge daemon.
//!
//! Discovers Chromecasts on the LAN, creates one virtual PulseAudio sink
//! per device and streams whatever is routed to that sink to a receiver
//! application running on the device.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use pulsecast_core::ChromecastsManager;
use tokio::signal;

use crate::config::ServerConfig;

/// Stdout color mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl From<ColorMode> for env_logger::WriteStyle {
    fn from(mode: ColorMode) -> Self {
        match mode {
            ColorMode::Auto => env_logger::WriteStyle::Auto,
            ColorMode::Always => env_logger::WriteStyle::Always,
            ColorMode::Never => env_logger::WriteStyle::Never,
        }
    }
}

/// Pulsecast Server - stream local audio to Chromecasts.
#[derive(Parser, Debug)]
#[command(name = "pulsecast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PULSECAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Stdout color mode.
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Chromecast receiver application id (overrides config file).
    #[arg(short, long, env = "PULSECAST_APP_ID")]
    app_id: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .write_style(args.color.into())
        .format_timestamp_millis()
        .init();

    log::info!("Pulsecast Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(app_id) = args.app_id {
        config.app_id = app_id;
    }
    log::info!("Configuration: app_id={}", config.app_id);

    let manager = ChromecastsManager::start(config.to_core_config())
        .await
        .context("Failed to start subsystems")?;
    let handle = manager.handle();

    let mut run_task = tokio::spawn(manager.run());

    tokio::select! {
        // A propagated component error ends the process with a failure.
        result = &mut run_task => {
            result.context("Manager task panicked")?.context("Component failed")?;
            return Ok(());
        }
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, cleaning up...");
            handle.stop();
        }
    }

    run_task
        .await
        .context("Manager task panicked")?
        .context("Component failed")?;

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
