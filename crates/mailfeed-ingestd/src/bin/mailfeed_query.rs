//! Read-only status queries against the ledger, printed as JSON.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;

use mailfeed_core::{AppConfig, IngestResult};
use mailfeed_storage::{Ledger, LedgerConfig};

/// Query ingestion progress from the status ledger.
#[derive(Debug, Parser)]
#[command(name = "mailfeed-query", version, about)]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Success/failure/pending counts for one domain.
    DomainStats { domain: String },
    /// Success/failure/pending counts for one user.
    UserStats { user_id: String },
    /// Latest received_time among completed messages.
    Progress,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("mailfeed-query: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> IngestResult<()> {
    let config = AppConfig::load(&args.config)?;
    let ledger = Ledger::open(LedgerConfig::at_path(&config.paths.sqlite_path))?;

    let output = match &args.command {
        Command::DomainStats { domain } => {
            serde_json::to_value(ledger.domain_stats(domain)?)
                .map_err(|error| mailfeed_core::IngestError::subsystem("query", error))?
        }
        Command::UserStats { user_id } => serde_json::to_value(ledger.user_stats(user_id)?)
            .map_err(|error| mailfeed_core::IngestError::subsystem("query", error))?,
        Command::Progress => json!({
            "last_completed_time": ledger.last_completed_time()?,
        }),
    };
    println!("{output}");
    Ok(())
}
