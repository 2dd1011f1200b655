use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use fo_orchestrator::{CancelHandle, Orchestrator, OrchestratorConfig, TrialSelection};
use fo_pool::{SimulatedPool, SimulatedPoolConfig};
use fo_types::{advisory_channel, Trial, TrialId};
use serde_json::json;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Run a batch of trials through the orchestrator against a simulated pool.
#[derive(Parser, Debug)]
#[command(name = "fanout-sim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Number of trials in the run
    #[arg(short = 'n', long, default_value_t = 6)]
    trials: u64,

    /// Only submit these trial numbers, e.g. "1-3,7"
    #[arg(short, long)]
    select: Option<TrialSelection>,

    /// Sleep between poll passes, in milliseconds
    #[arg(long, env = "FANOUT_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Simulated worker processes
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Seed for simulated trial durations
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Orchestrator config file (JSON)
    #[arg(short, long, env = "FANOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(ms) = cli.poll_interval_ms {
        config = config.with_poll_interval(Duration::from_millis(ms));
    }

    let (publisher, receiver) = advisory_channel();
    let pool = SimulatedPool::new(SimulatedPoolConfig {
        workers: cli.workers,
        seed: cli.seed,
        ..Default::default()
    })
    .with_advisory(publisher);

    let handler = |trial: &Trial| -> anyhow::Result<()> {
        let result = trial.result.as_ref().context("trial has no result")?;
        info!(trial = %trial.id, pid = ?trial.worker_pid, %result, "trial done");
        Ok(())
    };

    let cancel = CancelHandle::new();
    let mut orchestrator = Orchestrator::new(pool, handler, config)?
        .with_advisory(receiver)
        .with_cancel_handle(cancel.clone());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    orchestrator.wait_for_workers().await?;
    let payload = |i: u64| json!({ "trial": i, "seed": cli.seed });
    match &cli.select {
        Some(selection) => {
            orchestrator
                .submit_selected(selection, cli.trials, payload)
                .await?
        }
        None => orchestrator.submit_all(cli.trials, payload).await?,
    };

    let report = orchestrator.drive().await;
    let counts = report.counts();
    println!(
        "{}: {} processed, {} submit-failed, {} outstanding after {} iterations",
        report.outcome,
        counts.processed,
        counts.submit_failed,
        counts.outstanding(),
        report.iterations
    );
    for diagnostic in &report.diagnostics {
        println!("  {diagnostic}");
    }

    let redo: TrialSelection = report
        .trials
        .iter()
        .filter(|t| t.error.is_some() || t.is_outstanding())
        .filter_map(|t| match t.id {
            TrialId::Number(n) => Some(n),
            TrialId::Name(_) => None,
        })
        .collect();
    if !redo.is_empty() {
        println!("trials to redo: {redo}");
    }

    if !report.outcome.is_finished() {
        bail!("run ended with outcome {}", report.outcome);
    }
    Ok(())
}
