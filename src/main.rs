mod cache;
mod client;
mod config;
mod daemon;
mod dispatcher;
mod hasher;
mod inflight;
mod logging;
mod pool;
mod protocol;
mod queue;
mod server;
mod transport;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

use crate::client::Wire;
use crate::config::{Config, DIGEST_BLOCK_SIZE, INBOUND_FIFO, LEGACY_FIFO};

#[derive(Parser)]
#[command(name = "digestd")]
#[command(about = "File digest daemon with single-flight SHA-256 hashing over named pipes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the digest server
    Start {
        /// Inbound FIFO path
        #[arg(long)]
        fifo_path: Option<String>,

        /// Maximum concurrent workers
        #[arg(long)]
        max_workers: Option<usize>,

        /// Maximum queued requests (also bounds in-flight digests)
        #[arg(long)]
        queue_capacity: Option<usize>,

        /// Maximum cached digests
        #[arg(long)]
        cache_capacity: Option<usize>,
    },

    /// Start a server for the fixed-record single-shot protocol
    StartLegacy {
        /// Inbound FIFO path
        #[arg(long)]
        fifo_path: Option<String>,
    },

    /// Ask a running server for the digests of some files
    Request {
        /// Files to digest
        #[arg(required = true)]
        files: Vec<String>,

        /// Server inbound FIFO path
        #[arg(long)]
        fifo_path: Option<String>,

        /// Talk to a `start-legacy` server instead
        #[arg(long)]
        legacy: bool,

        /// Print one JSON object per file
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    logging::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start {
            fifo_path,
            max_workers,
            queue_capacity,
            cache_capacity,
        } => server::run(Config::with_overrides(
            fifo_path,
            max_workers,
            queue_capacity,
            cache_capacity,
        )),
        Commands::StartLegacy { fifo_path } => server::run_legacy(
            PathBuf::from(fifo_path.as_deref().unwrap_or(LEGACY_FIFO)),
            DIGEST_BLOCK_SIZE,
        ),
        Commands::Request {
            files,
            fifo_path,
            legacy,
            json,
        } => {
            let (default_fifo, wire) = if legacy {
                (LEGACY_FIFO, Wire::Legacy)
            } else {
                (INBOUND_FIFO, Wire::Queued)
            };
            let inbound = PathBuf::from(fifo_path.as_deref().unwrap_or(default_fifo));
            let reports = client::request(&inbound, &files, wire);
            let failed = reports.iter().any(|r| r.error.is_some());
            match client::print(&reports, json, &mut std::io::stdout().lock()) {
                Ok(()) if failed => return ExitCode::FAILURE,
                Ok(()) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
