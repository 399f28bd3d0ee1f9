use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::Level;

use mailfeed_core::tracing_config;
use mailfeed_core::{AppConfig, IngestResult};
use mailfeed_ingestd::{Orchestrator, ShutdownCoordinator};
use mailfeed_sink::WeaviateConnector;

/// Durable multi-worker batch ingestion daemon.
#[derive(Debug, Parser)]
#[command(name = "mailfeed-ingestd", version, about)]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, value_name = "FILE")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args.config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("mailfeed-ingestd: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &Path) -> IngestResult<()> {
    let config = AppConfig::load(config_path)?;
    let level = tracing_config::effective_level(&config.logging.level, Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .init();
    tracing::info!(
        target: "mailfeed.ingestd",
        config = %config_path.display(),
        "starting mailfeed ingest daemon"
    );

    let shutdown = Arc::new(ShutdownCoordinator::new());
    shutdown.register_signals()?;

    let connector = Arc::new(WeaviateConnector::new(config.weaviate.clone()));
    let result = Orchestrator::bootstrap(config, connector, Arc::clone(&shutdown))
        .and_then(|mut orchestrator| orchestrator.run());

    shutdown.stop_signal_listener();
    match &result {
        Ok(()) => tracing::info!(target: "mailfeed.ingestd", "daemon stopped cleanly"),
        Err(error) => tracing::error!(target: "mailfeed.ingestd", %error, "daemon stopped with error"),
    }
    result
}
