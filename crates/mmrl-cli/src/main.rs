use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mmrl_storage::{LocalObjectStore, RunStateStore};
use mmrl_sync::{build_scheduler, IngestPipeline, PipelineConfig, RunOptions};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mmrl-cli")]
#[command(about = "Loads mass-message history reports from notification emails into a table")]
struct Cli {
    /// Tracing filter such as `info` or `mmrl_sync=debug`; defaults to RUST_LOG, then `info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process new report notifications once.
    Run {
        /// Forget processed ids and search without the recency filter.
        #[arg(long)]
        full: bool,
        #[arg(long)]
        max_messages: Option<usize>,
    },
    /// Print the persisted run state.
    State,
    /// Run incrementally on the configured cron schedule until interrupted.
    Schedule,
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let command = cli.command.unwrap_or(Commands::Run {
        full: false,
        max_messages: None,
    });
    match command {
        Commands::Run { full, max_messages } => run_once(full, max_messages).await?,
        Commands::State => print_state().await?,
        Commands::Schedule => schedule().await?,
    }

    Ok(())
}

async fn run_once(full: bool, max_messages: Option<usize>) -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let pipeline = IngestPipeline::from_config(config)?;
    let interrupt = pipeline.stop_on_ctrl_c();

    let summary = pipeline.run(RunOptions { full, max_messages }).await?;
    interrupt.abort();

    println!(
        "run complete: run_id={} found={} skipped={} processed={} failed={} rows_loaded={} duplicates={}{}",
        summary.run_id,
        summary.stats.found,
        summary.already_processed,
        summary.stats.processed,
        summary.stats.failed,
        summary.stats.rows_loaded,
        summary.stats.duplicates_skipped,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    for failure in &summary.failures {
        println!(
            "  failed {} at {:?}: {} ({})",
            failure.message_id, failure.stage, failure.reason, failure.detail
        );
    }
    Ok(())
}

async fn print_state() -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let store = RunStateStore::new(Arc::new(LocalObjectStore::new(config.data_dir.clone())), config.state_key.clone());
    match store.load().await? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state).context("rendering run state")?),
        None => println!(
            "no run state at {}",
            config.data_dir.join(&config.state_key).display()
        ),
    }
    Ok(())
}

async fn schedule() -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let crons = config.schedule_crons.clone();
    if crons.is_empty() {
        anyhow::bail!("no cron expressions configured (set MMRL_SCHEDULE)");
    }
    let pipeline = Arc::new(IngestPipeline::from_config(config)?);

    let mut sched = build_scheduler(pipeline.clone(), &crons).await?;
    sched.start().await.context("starting scheduler")?;
    info!(jobs = crons.len(), "scheduler running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    warn!("interrupt received; stopping scheduler");
    pipeline.stop_handle().store(true, Ordering::SeqCst);
    sched.shutdown().await.context("stopping scheduler")?;
    pipeline.wait_idle().await;
    info!("scheduler stopped; run state checkpointed");
    Ok(())
}
