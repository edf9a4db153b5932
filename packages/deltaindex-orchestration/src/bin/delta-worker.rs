//! Delta Worker CLI
//!
//! Runs one delta job, previews the decision for an index, or flips the
//! operator switches. Workers on different hosts share state through the
//! SQLite file given with `--state`.
//!
//! # Usage
//!
//! ```bash
//! # Process one job; exits 75 when the lock is busy and the job must be retried
//! delta-worker --config deltas.yaml --state /var/lib/deltaindex/state.sqlite3 perform articles_delta
//!
//! # What would the next run do?
//! delta-worker --config deltas.yaml plan articles_delta
//!
//! # Pause / resume processing, force a full rebuild next run
//! delta-worker suspend articles_delta
//! delta-worker resume articles_delta
//! delta-worker request-rebuild articles_delta
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use deltaindex_orchestration::{
    CommandIndexer, DeltaConfig, DeltaWorker, InMemoryJobQueue, IndexJob, ProcessTableDetector,
};
use deltaindex_storage::{SqliteCoordinationStore, SqliteRecordStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "delta-worker")]
#[command(about = "Delta index worker - incremental reindex with locking and quorum", long_about = None)]
struct Cli {
    /// Versioned YAML configuration; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite file holding coordination state and delta-flagged records
    #[arg(short, long, global = true, default_value = "deltaindex.sqlite3")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one delta job for an index
    Perform {
        /// Delta index name, e.g. articles_delta
        index: String,
    },

    /// Print the decision the next run would take, without running it
    Plan { index: String },

    /// Skip jobs for an index until resumed
    Suspend { index: String },

    /// Undo `suspend`
    Resume { index: String },

    /// Drop the marker that forces a full rebuild on the next run
    RequestRebuild { index: String },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DeltaConfig> {
    match path {
        Some(path) => DeltaConfig::from_yaml(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(DeltaConfig::default()),
    }
}

fn build_worker(config: DeltaConfig, state: &Path) -> anyhow::Result<DeltaWorker> {
    let coordination = SqliteCoordinationStore::open(state)
        .with_context(|| format!("opening coordination state {}", state.display()))?;
    let records = SqliteRecordStore::open(state)
        .with_context(|| format!("opening record store {}", state.display()))?;
    let indexer = CommandIndexer::new(&config.indexer);

    Ok(DeltaWorker::new(
        Arc::new(config),
        Arc::new(coordination),
        Arc::new(records),
        Arc::new(indexer),
        Arc::new(InMemoryJobQueue::new()),
    )
    .with_detector(Arc::new(ProcessTableDetector::default())))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Perform { index } => {
            let worker = build_worker(config, &cli.state)?;
            let outcome = worker.perform(&index).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            return Ok(ExitCode::from(outcome.exit_status()));
        }
        Commands::Plan { index } => {
            let worker = build_worker(config, &cli.state)?;
            let planned = worker.plan(&index)?;
            println!("{}", serde_json::to_string_pretty(&planned)?);
        }
        Commands::Suspend { index } => {
            let worker = build_worker(config, &cli.state)?;
            worker.job(&index)?;
            worker.suspend_switch().suspend(&index).await?;
            println!("suspended {}", index);
        }
        Commands::Resume { index } => {
            let worker = build_worker(config, &cli.state)?;
            if worker.suspend_switch().resume(&index).await? {
                println!("resumed {}", index);
            } else {
                println!("{} was not suspended", index);
            }
        }
        Commands::RequestRebuild { index } => {
            let job = IndexJob::new(&index, &config)?;
            job.request_full_rebuild()?;
            println!(
                "full rebuild of {} requested ({})",
                job.base_index,
                job.marker_path.display()
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
