//! stratusd — the Stratus daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Locked dispatcher over the job table
//! - Job lifecycle processor
//! - Periodic replica reconciliation
//!
//! Cloud backends implement `stratus_offers::ComputeBackend` and are
//! registered by the deployment; the daemon itself ships none.
//!
//! # Usage
//!
//! ```text
//! stratusd run --data-dir /var/lib/stratus --workers 4
//! ```

mod collaborators;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use stratus_dispatch::{DispatcherConfig, JobSource, LockedDispatcher, ProcessFn};
use stratus_orchestrator::{JobProcessor, ProcessorConfig};
use stratus_state::{Job, StateStore};

use crate::collaborators::{FsCodeSource, JsonlLogSink, UnconfiguredConnector};

#[derive(Parser)]
#[command(name = "stratusd", about = "Stratus orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Data directory for persistent state, code artifacts, and logs.
        #[arg(long, default_value = "/var/lib/stratus")]
        data_dir: PathBuf,

        /// Concurrent job-processing workers.
        #[arg(long, default_value = "4")]
        workers: usize,

        /// Job lock timeout in seconds.
        #[arg(long, default_value = "60")]
        lock_timeout: u64,

        /// Replica reconciliation interval in seconds.
        #[arg(long, default_value = "30")]
        reconcile_interval: u64,

        /// How long a provisioned runner may take to become reachable,
        /// in seconds.
        #[arg(long, default_value = "600")]
        runner_boot_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stratusd=debug,stratus=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            workers,
            lock_timeout,
            reconcile_interval,
            runner_boot_timeout,
        } => {
            run_daemon(
                data_dir,
                workers,
                Duration::from_secs(lock_timeout),
                Duration::from_secs(reconcile_interval),
                Duration::from_secs(runner_boot_timeout),
            )
            .await
        }
    }
}

async fn run_daemon(
    data_dir: PathBuf,
    workers: usize,
    lock_timeout: Duration,
    reconcile_interval: Duration,
    runner_boot_timeout: Duration,
) -> anyhow::Result<()> {
    info!("stratus daemon starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("stratus.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Backends are registered by the deployment; none ship here.
    let processor = Arc::new(JobProcessor::new(
        store.clone(),
        Vec::new(),
        Arc::new(UnconfiguredConnector),
        Arc::new(FsCodeSource::new(&data_dir)),
        Arc::new(JsonlLogSink::new(&data_dir)),
        ProcessorConfig {
            runner_boot_timeout,
            ..ProcessorConfig::default()
        },
    ));
    info!("job processor initialized");

    let dispatcher = Arc::new(LockedDispatcher::new(
        JobSource::new(store.clone()),
        process_fn(processor),
        DispatcherConfig {
            workers,
            lock_timeout,
            ..DispatcherConfig::default()
        },
    ));
    dispatcher.start();

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Replica reconciliation loop ────────────────────────────

    let reconcile_handle = tokio::spawn(reconcile_loop(
        store.clone(),
        dispatcher.clone(),
        reconcile_interval,
        shutdown_rx,
    ));

    // ── Wait for ctrl-c ────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    dispatcher.shutdown().await;
    let _ = reconcile_handle.await;

    info!("stratus daemon stopped");
    Ok(())
}

/// Adapt the processor to the dispatcher's callback shape.
fn process_fn(processor: Arc<JobProcessor>) -> ProcessFn<Job> {
    Arc::new(move |job: Job| {
        let processor = processor.clone();
        Box::pin(async move { processor.process(job).await.map_err(anyhow::Error::from) })
    })
}

/// Keeps every run's live replica count inside its declared range.
///
/// Live counts below `replicas.min` are topped up with fresh Submitted
/// rows; counts above `replicas.max` are trimmed. An external autoscaler
/// adjusting within the range uses the same scale/apply path.
async fn reconcile_loop(
    store: StateStore,
    dispatcher: Arc<LockedDispatcher<JobSource>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if let Err(e) = reconcile_once(&store, &dispatcher) {
            error!(error = %e, "replica reconciliation failed");
        }
    }
}

fn reconcile_once(
    store: &StateStore,
    dispatcher: &LockedDispatcher<JobSource>,
) -> anyhow::Result<()> {
    let mut created = 0usize;
    for run in store.list_runs()? {
        let jobs = store.list_jobs_for_run(run.id)?;
        let live = jobs.iter().filter(|j| !j.status.is_finished()).count() as i64;

        let min = run.replicas.min.unwrap_or(0) as i64;
        let max = run.replicas.max.map(i64::from).unwrap_or(i64::MAX);
        // min wins over max if the range is inverted.
        let diff = live.min(max).max(min) - live;
        if diff == 0 {
            continue;
        }

        let plan = stratus_scale::scale(&run, &jobs, diff);
        created += plan.new_jobs.len();
        stratus_scale::apply_plan(store, &run, &plan)?;
    }
    if created > 0 {
        // New Submitted rows exist; skip the fetch backoff.
        dispatcher.hint();
    }
    Ok(())
}
