mod adapters;
mod cli;
mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use weft_core::domain::{TaskId, WorkerId};
use weft_core::impls::{LogNotifier, SqliteJobStore};
use weft_core::{Orchestrator, OrchestratorBuilder, WorkerGroup};

use crate::adapters::{CommandExecutor, FilePlanDecomposer};
use crate::cli::{CliArgs, Command};
use crate::config::CliConfig;

#[tokio::main]
async fn main() {
    if let Err(err) = run_main().await {
        eprintln!("weft error: {err:?}");
        std::process::exit(1);
    }
}

async fn run_main() -> Result<()> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    run(args).await
}

async fn run(args: CliArgs) -> Result<()> {
    let explicit = args.config.is_some();
    let path = args.config.unwrap_or_else(|| PathBuf::from("weft.toml"));
    let config = CliConfig::load(&path, explicit)?;
    let orchestrator = build(&config).await?;

    match args.command {
        Command::Submit { goal, project } => {
            let job_id = orchestrator.submit(&goal, &project).await?;
            print_json(&serde_json::json!({ "job_id": job_id }))
        }
        Command::Status { job } => print_json(&orchestrator.status(job).await?),
        Command::Approve { job } => {
            let revision = orchestrator.approve(job).await?;
            print_json(&serde_json::json!({ "job_id": job, "audit_revision": revision }))
        }
        Command::Revise { job, feedback } => {
            let revision = orchestrator.revise(job, &feedback).await?;
            print_json(&serde_json::json!({ "job_id": job, "audit_revision": revision }))
        }
        Command::Cancel { job } => {
            orchestrator.cancel(job).await?;
            print_json(&serde_json::json!({ "job_id": job, "status": "cancelled" }))
        }
        Command::Resume { job, task, answer } => {
            let ack = orchestrator.resume(job, &TaskId::new(task), &answer).await?;
            print_json(&serde_json::json!({ "job_id": job, "result": ack }))
        }
        Command::Events { job, limit } => {
            let events = orchestrator.events(job).await?;
            let skip = limit.map_or(0, |n| events.len().saturating_sub(n));
            print_json(&events[skip..])
        }
        Command::Worker {
            once,
            interval_ms,
            worker_id,
        } => run_worker(&orchestrator, WorkerId::new(worker_id), once, interval_ms).await,
    }
}

async fn build(config: &CliConfig) -> Result<Orchestrator> {
    let store = SqliteJobStore::open(&config.database)
        .await
        .with_context(|| format!("opening store at {}", config.database.display()))?;
    let commands = config
        .executors
        .iter()
        .map(|(name, e)| (name.clone(), e.command.clone()))
        .collect();

    let mut builder = OrchestratorBuilder::new(Arc::new(store))
        .config(config.orchestrator.clone())
        .notifier(Arc::new(LogNotifier))
        .decomposer(Arc::new(FilePlanDecomposer::new(config.plans_dir.clone())))
        .executor(Arc::new(CommandExecutor::new(commands)));
    if !config.executors.is_empty() {
        builder = builder.expect_executors(&config.executor_names());
    }
    builder.build().context("building orchestrator")
}

async fn run_worker(
    orchestrator: &Orchestrator,
    worker_id: WorkerId,
    once: bool,
    interval_ms: u64,
) -> Result<()> {
    let worker = orchestrator.worker(worker_id);
    if once {
        let report = worker.tick().await?;
        return print_json(&report);
    }

    let group = WorkerGroup::spawn(vec![worker], Duration::from_millis(interval_ms));
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutdown requested, waiting for workers");
    group.shutdown_and_join().await;
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("encoding output")?;
    println!("{text}");
    Ok(())
}
