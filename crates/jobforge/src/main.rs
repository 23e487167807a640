//! Jobforge demo binary.
//!
//! Schedules a handful of example jobs against a freshly constructed engine
//! and prints their outcomes. Also doubles as the PROCESS-mode worker child:
//! when re-invoked with the hidden `--jobforge-subprocess-worker` flag it
//! runs a single job and exits instead of starting the engine.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use jobforge::handlers::{self, CANCELLABLE_LOOP, DIVIDE, IDENTITY, REPORT_PROGRESS};
use jobforge::{Client, Engine, EngineConfig, HandlerRegistry, ScheduleOptions, StorageKind, WorkerType, SUBPROCESS_FLAG};
use jobforge_logging::{init_logging, LogConfig};
use serde_json::json;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum WorkerTypeArg {
    Thread,
    Process,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StorageArg {
    Memory,
    Sqlite,
}

#[derive(Parser, Debug)]
#[command(name = "jobforge", about = "Jobforge engine demo")]
struct Args {
    /// Execution substrate for scheduled jobs.
    #[arg(long, value_enum, default_value = "thread")]
    worker_type: WorkerTypeArg,

    /// Persistence backend.
    #[arg(long, value_enum, default_value = "memory")]
    storage: StorageArg,

    /// Path to the SQLite database file (ignored for `--storage memory`).
    #[arg(long, default_value = "jobforge.db")]
    db_path: PathBuf,

    /// Number of concurrent execution slots.
    #[arg(long, default_value_t = 4)]
    num_workers: usize,

    /// Enable verbose (debug-level) logging.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Suppress console logging below `warn`; the rolling log file is
    /// unaffected.
    #[arg(short = 'q', long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A PROCESS-mode worker pool re-invokes this very binary with a hidden
    // flag; detect that before touching any normal engine machinery.
    if std::env::args().any(|arg| arg == SUBPROCESS_FLAG) {
        let mut registry = HandlerRegistry::new();
        handlers::register_examples(&mut registry);
        jobforge::run_subprocess_entrypoint(&registry);
    }

    let args = Args::parse();

    init_logging(LogConfig { app_name: "jobforge", verbose: args.verbose, quiet: args.quiet })?;

    let config = EngineConfig {
        worker_type: match args.worker_type {
            WorkerTypeArg::Thread => WorkerType::Thread,
            WorkerTypeArg::Process => WorkerType::Process,
        },
        storage: match args.storage {
            StorageArg::Memory => StorageKind::Memory,
            StorageArg::Sqlite => StorageKind::Sqlite(args.db_path.clone()),
        },
        num_workers: args.num_workers,
    };

    let mut registry = HandlerRegistry::new();
    handlers::register_examples(&mut registry);

    tracing::info!(?config, "starting jobforge demo");
    let engine = Engine::new(config, registry).await?;
    let client = Client::new(engine.clone());

    let identity_id = client.schedule(IDENTITY, json!(9), json!({}), ScheduleOptions::default()).await?;
    let divide_id = client.schedule(DIVIDE, json!([1, 0]), json!({}), ScheduleOptions::default()).await?;
    let progress_id = client
        .schedule(
            REPORT_PROGRESS,
            json!(5),
            json!({}),
            ScheduleOptions { track_progress: true, ..Default::default() },
        )
        .await?;
    let cancel_id = client
        .schedule(
            CANCELLABLE_LOOP,
            json!(1000),
            json!({}),
            ScheduleOptions { cancellable: true, ..Default::default() },
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel(&cancel_id).await?;

    for (label, job_id) in [
        ("identity", &identity_id),
        ("divide-by-zero", &divide_id),
        ("progress", &progress_id),
        ("cancelled", &cancel_id),
    ] {
        let job = client.wait_for_completion(job_id, Some(Duration::from_secs(5))).await?;
        println!("{label}: state={:?} result={:?} exception={:?}", job.state, job.result, job.exception);
    }

    engine.shutdown(true).await;
    Ok(())
}
