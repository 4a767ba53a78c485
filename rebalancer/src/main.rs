//! CLI entry point for the folio rebalancer.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::warn;

use folio::CancelToken;
use folio_rebalancer::commands::{self, ReplayOptions};
use folio_rebalancer::config::Config;
use folio_rebalancer::error::Error;

#[derive(Parser)]
#[command(name = "rebalancer")]
#[command(about = "Idempotent portfolio-rebalance intake")]
#[command(version)]
struct Cli {
    /// Path to config.toml (defaults apply when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a JSONL stream of rebalance events
    Consume {
        /// Event file, one JSON event per line (stdin when omitted or `-`)
        input: Option<PathBuf>,
    },

    /// Re-apply one event, bypassing duplicate suppression
    Replay {
        /// Path to the event JSON
        event: PathBuf,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },

    /// List requests whose transactions were never stored
    Failed,

    /// Print the canonical form and fingerprint of an allocation file
    Fingerprint {
        /// Path to allocation JSON (`{"asset": weight, ...}`)
        allocation: PathBuf,
    },

    /// Show the transactions moving CURRENT to NEW
    Diff {
        new: PathBuf,
        current: PathBuf,

        /// User id stamped on the transactions
        #[arg(long, default_value = "-")]
        user: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => Config::load(p).with_context(|| format!("loading config {}", p.display())),
        None => Ok(Config::default()),
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Consume { input } => {
            let config = load_config(cli.config.as_ref())?;
            let cancel = CancelToken::new();
            let handler_cancel = cancel.clone();
            ctrlc::set_handler(move || {
                warn!("interrupt received, shutting down");
                handler_cancel.cancel();
            })
            .context("installing Ctrl-C handler")?;

            let summary = commands::consume(&config, input.as_deref(), cancel)?;
            Ok(if summary.failed > 0 {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Replay { event, force } => {
            let config = load_config(cli.config.as_ref())?;
            match commands::replay(&config, &event, &ReplayOptions { force }) {
                Ok(outcome) if outcome.is_failed() => Ok(ExitCode::from(2)),
                Ok(_) => Ok(ExitCode::SUCCESS),
                Err(Error::Aborted(msg)) => {
                    eprintln!("{msg}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Failed => {
            let config = load_config(cli.config.as_ref())?;
            commands::show_failed(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Fingerprint { allocation } => {
            commands::show_fingerprint(&allocation)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Diff { new, current, user } => {
            commands::show_diff(&new, &current, &user)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
