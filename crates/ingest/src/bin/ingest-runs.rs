//! ingest-runs: operator CLI over the configured ingest run store.
//!
//! Every invocation restores the tracker from the store, performs one
//! operation and prints the affected run(s) as JSON. With the `memory`
//! backend nothing outlives the process, so use `jsonl` or `postgres` for
//! anything but `run`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use chess_core::{Config, StoreBackend};
use chess_ingest::{
    store, CreateIngestRequest, IngestRunTracker, IngestRunView, IngestRunner, RandomIds,
    RunStatus, SimulatedExecutor, SystemClock,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Create, advance and inspect ingest runs.
#[derive(Parser, Debug)]
#[command(name = "ingest-runs", version, about)]
struct Cli {
    /// Persistence backend: memory, jsonl or postgres (overrides INGEST_STORE).
    #[arg(long)]
    store: Option<StoreBackend>,

    /// Data directory for the jsonl backend (overrides DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new PENDING run.
    Create {
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Move a run to another status.
    Transition { id: Uuid, status: RunStatus },
    /// Show one run.
    Get { id: Uuid },
    /// List runs, oldest first.
    List {
        /// Only runs in this status.
        #[arg(long)]
        status: Option<RunStatus>,
        /// Only runs for this dataset (newest first).
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Create a run and execute it with the simulated executor.
    Run {
        #[command(flatten)]
        request: RequestArgs,
    },
}

#[derive(clap::Args, Debug)]
struct RequestArgs {
    /// Account whose games are ingested.
    #[arg(long)]
    user: String,
    /// Ingestion period, repeat in processing order (e.g. --month 2024-01 --month 2024-02).
    #[arg(long = "month", required = true)]
    months: Vec<String>,
    #[arg(long, default_value = "")]
    dataset: String,
    #[arg(long, default_value = "")]
    note: String,
}

impl From<RequestArgs> for CreateIngestRequest {
    fn from(args: RequestArgs) -> Self {
        Self {
            user: args.user,
            months: args.months,
            dataset_id: args.dataset,
            note: args.note,
        }
    }
}

// ── Main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    chess_core::load_dotenv();
    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(backend) = cli.store {
        config.ingest.store = backend;
    }
    if let Some(dir) = cli.data_dir.clone() {
        config.storage.data_dir = dir;
    }
    config.log_summary();

    let store = store::open(&config).await?;
    let tracker = Arc::new(
        IngestRunTracker::restore(store, Arc::new(SystemClock), Arc::new(RandomIds)).await?,
    );

    match cli.command {
        Command::Create { request } => {
            let run = tracker.create_from_request(request.into()).await?;
            print_json(&IngestRunView::from(run))?;
        }
        Command::Transition { id, status } => {
            let run = tracker.transition(id, status).await?;
            print_json(&IngestRunView::from(run))?;
        }
        Command::Get { id } => {
            let run = tracker.get(id)?;
            print_json(&IngestRunView::from(run))?;
        }
        Command::List { status, dataset } => {
            let runs = match dataset {
                Some(dataset) => tracker.list_by_dataset(&dataset),
                None => tracker.list(status),
            };
            let views: Vec<IngestRunView> = runs
                .iter()
                .filter(|run| status.map_or(true, |s| run.status == s))
                .map(IngestRunView::from)
                .collect();
            print_json(&views)?;
        }
        Command::Run { request } => {
            let executor = Arc::new(SimulatedExecutor::from_config(&config.ingest));
            let runner = IngestRunner::new(tracker.clone(), executor)
                .with_max_concurrent(config.ingest.max_concurrent);
            let submission = runner.submit(request.into()).await?;
            info!(run_id = %submission.run.id, "ingest run submitted, waiting for completion");

            let run = submission.handle.await??;
            print_json(&IngestRunView::from(run))?;
            info!(stats = ?runner.stats(), "runner finished");
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
