use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use window_throttle::adapter::ReplayServer;
use window_throttle::config::{dev_mode_from_env, LogConfig, LogFormat, ThrottleConfig};
use window_throttle::ratelimit::AdmissionController;

/// Sliding-window admission control.
#[derive(Parser, Debug)]
#[command(name = "window-throttle", version, about)]
struct Cli {
    /// Directory holding config.*, prod.config.* and dev.config.*
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Also load dev.config.* (same as THROTTLE_DEVMODE=1)
    #[arg(long)]
    dev: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decide on JSON-lines requests read from a file or stdin
    Replay {
        /// Input file; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Print the effective configuration
    ShowConfig {
        /// Also write it to this path
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let dev_mode = cli.dev || dev_mode_from_env();

    let config = ThrottleConfig::load(&cli.config_dir, dev_mode)
        .with_context(|| format!("loading configuration from {}", cli.config_dir.display()))?;
    init_tracing(&config.log);

    info!("Starting Window Throttle");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        dir = %cli.config_dir.display(),
        dev_mode,
        rate_limit = config.service.rate_limit.enable,
        "Configuration loaded"
    );

    match cli.command {
        Command::ShowConfig { write } => {
            print!("{}", config.to_yaml()?);
            if let Some(path) = write {
                config.write_merged(&path)?;
            } else if !dev_mode {
                config.write_merged(cli.config_dir.join("merged.config.yml"))?;
            }
        }
        Command::Replay { input } => {
            let limiter_config = config
                .limiter_config()
                .context("invalid rate limit configuration")?
                .context("rate limiting is not enabled (service.rate_limit.enable)")?;
            let controller = Arc::new(AdmissionController::new(limiter_config));
            let server = ReplayServer::new(controller);
            let stdout = tokio::io::stdout();

            let stats = match input {
                Some(path) => {
                    let file = tokio::fs::File::open(&path)
                        .await
                        .with_context(|| format!("opening {}", path.display()))?;
                    server
                        .serve_with_shutdown(BufReader::new(file), stdout, shutdown_signal())
                        .await?
                }
                None => {
                    server
                        .serve_with_shutdown(BufReader::new(tokio::io::stdin()), stdout, shutdown_signal())
                        .await?
                }
            };
            info!(total = stats.total(), "Window Throttle stopped");
        }
    }

    Ok(())
}

/// Log to stderr so stdout carries only decisions.
fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
