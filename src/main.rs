//! runforge scheduler entry point.
//!
//! Initializes logging, loads configuration, assembles the application
//! and runs it until interrupted.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runforge::{ApplicationServices, SchedulerConfig};

#[derive(Parser, Debug)]
#[command(name = "runforge", version, about = "Durable algorithm-run scheduler")]
struct Cli {
    /// Path to the YAML configuration file. Falls back to environment
    /// variables when omitted.
    #[arg(short, long, env = "RUNFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > --log-level CLI arg > default "info"
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_filter)))
        .init();

    let config = match &cli.config {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::from_env()?,
    };

    let app = ApplicationServices::new(config).build().await?;
    app.start();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    app.shutdown().await;

    Ok(())
}
