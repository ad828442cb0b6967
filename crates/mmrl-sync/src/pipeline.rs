//! One ingestion run: discover messages, push each through extract, download, validate,
//! normalize and load, then checkpoint the run state.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::{future, stream, FutureExt, StreamExt};
use mmrl_adapters::{normalize_file, DownloadError, Downloader, LinkResolver, NormalizerConfig, ValidatedFile};
use mmrl_core::{FailureReason, MessageFailure, MessageRef, MessageStage, RunState, RunStats, Table};
use mmrl_storage::{archive_key, sha256_hex, HttpFetcher, LocalObjectStore, ObjectStore, RunStateStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::gate::{DedupLoadGate, LoadOutcome};
use crate::sink::{JsonlTableSink, PgTableSink, TableSink};
use crate::source::{widen_query, GmailMessageSource, MessageSource, SourceError, SpoolMessageSource};
use crate::{PipelineConfig, SinkKind, SourceKind};

pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("message discovery failed: {0}")]
    Source(#[source] SourceError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Reprocess everything: forget prior state, drop the recency filter, raise the limit.
    pub full: bool,
    pub max_messages: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub query: String,
    pub stats: RunStats,
    pub already_processed: usize,
    pub interrupted: bool,
    pub failures: Vec<MessageFailure>,
}

enum MessageOutcome {
    Loaded { message_id: String, outcome: LoadOutcome },
    Failed(MessageFailure),
}

#[derive(Default)]
struct RunTally {
    query: String,
    already_processed: usize,
    interrupted: bool,
    failures: Vec<MessageFailure>,
}

/// Last stage a message entered, read back when its budget runs out.
struct StageCell(StdMutex<MessageStage>);

impl StageCell {
    fn new() -> Self {
        Self(StdMutex::new(MessageStage::Discovered))
    }

    fn set(&self, stage: MessageStage) {
        if let Ok(mut current) = self.0.lock() {
            *current = stage;
        }
    }

    fn get(&self) -> MessageStage {
        self.0.lock().map(|current| *current).unwrap_or(MessageStage::Discovered)
    }
}

fn failure(message_id: &str, stage: MessageStage, reason: FailureReason, detail: String) -> MessageFailure {
    MessageFailure {
        message_id: message_id.to_string(),
        stage,
        reason,
        detail,
    }
}

pub struct IngestPipeline {
    config: PipelineConfig,
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn TableSink>,
    objects: Arc<dyn ObjectStore>,
    state_store: RunStateStore,
    resolver: LinkResolver,
    downloader: Downloader,
    gate: DedupLoadGate,
    normalizer: NormalizerConfig,
    stop: Arc<AtomicBool>,
    run_lock: Mutex<()>,
}

impl IngestPipeline {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn TableSink>,
        objects: Arc<dyn ObjectStore>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        let resolver = LinkResolver::new(config.report_domain.clone());
        let downloader = Downloader::new(http, resolver.clone(), config.work_dir.clone());
        let state_store = RunStateStore::new(objects.clone(), config.state_key.clone());
        let gate = DedupLoadGate::new(config.recovery_dir.clone());
        let normalizer = config.normalizer_config();
        Self {
            config,
            source,
            sink,
            objects,
            state_store,
            resolver,
            downloader,
            gate,
            normalizer,
            stop: Arc::new(AtomicBool::new(false)),
            run_lock: Mutex::new(()),
        }
    }

    /// Wires the source, sink and stores named by `config`.
    pub fn from_config(config: PipelineConfig) -> anyhow::Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let source: Arc<dyn MessageSource> = match config.source {
            SourceKind::Gmail => {
                let token = config
                    .gmail_access_token
                    .clone()
                    .context("MMRL_GMAIL_ACCESS_TOKEN is required for the gmail source")?;
                Arc::new(GmailMessageSource::new(
                    config.gmail_api_base.clone(),
                    config.gmail_user.clone(),
                    token,
                    Duration::from_secs(config.http_timeout_secs),
                )?)
            }
            SourceKind::Spool => Arc::new(SpoolMessageSource::new(config.spool_dir.clone())),
        };
        let sink: Arc<dyn TableSink> = match config.sink {
            SinkKind::Postgres => Arc::new(
                PgTableSink::connect_lazy(&config.database_url, &config.table_name)
                    .context("configuring the postgres sink")?,
            ),
            SinkKind::Jsonl => Arc::new(JsonlTableSink::new(config.jsonl_path.clone())),
        };
        let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(config.data_dir.clone()));
        Ok(Self::new(config, source, sink, objects, http))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state_store(&self) -> &RunStateStore {
        &self.state_store
    }

    /// Setting the flag stops new messages from starting; in-flight ones finish.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn stop_on_ctrl_c(&self) -> JoinHandle<()> {
        let stop = self.stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; letting in-flight messages finish");
                stop.store(true, Ordering::SeqCst);
            }
        })
    }

    /// Runs are serialized; a second caller waits for the first to checkpoint.
    pub async fn run(&self, options: RunOptions) -> Result<RunSummary, PipelineError> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, full = options.full);
        self.run_inner(run_id, options).instrument(span).await
    }

    /// Resolves once no run holds the run lock, i.e. any in-flight run has checkpointed.
    pub async fn wait_idle(&self) {
        let _guard = self.run_lock.lock().await;
    }

    async fn run_inner(&self, run_id: Uuid, options: RunOptions) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let mut state = self.load_state(options.full).await;
        state.begin_run(options.full);
        let mut tally = RunTally::default();

        let driven = AssertUnwindSafe(self.drive(options, &mut state, &mut tally))
            .catch_unwind()
            .await;

        // Checkpoint regardless of how the run ended.
        state.finish_run(Utc::now());
        match self.state_store.save(&state).await {
            Ok(()) => info!(
                key = self.state_store.key(),
                processed_ids = state.processed_ids.len(),
                "run state saved"
            ),
            Err(err) => error!(error = %err, "failed to save run state"),
        }

        match driven {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "run aborted");
                return Err(err);
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: state.last_run.unwrap_or_else(Utc::now),
            query: tally.query,
            stats: state.stats.clone(),
            already_processed: tally.already_processed,
            interrupted: tally.interrupted,
            failures: tally.failures,
        };
        info!(
            found = summary.stats.found,
            processed = summary.stats.processed,
            failed = summary.stats.failed,
            rows_loaded = summary.stats.rows_loaded,
            duplicates_skipped = summary.stats.duplicates_skipped,
            already_processed = summary.already_processed,
            interrupted = summary.interrupted,
            "run complete"
        );
        match write_run_report(&self.config.reports_dir, &summary).await {
            Ok(path) => info!(path = %path.display(), "wrote run report"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to write run report"),
        }
        Ok(summary)
    }

    async fn load_state(&self, full: bool) -> RunState {
        let mut state = match self.state_store.load().await {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!(key = self.state_store.key(), "no prior run state; starting fresh");
                RunState::default()
            }
            Err(err) => {
                warn!(error = %err, "run state unusable; starting fresh");
                RunState::default()
            }
        };
        if full || self.config.reset_state {
            info!(full, reset_state = self.config.reset_state, "clearing processed ids");
            state.reset();
        }
        state
    }

    async fn drive(
        &self,
        options: RunOptions,
        state: &mut RunState,
        tally: &mut RunTally,
    ) -> Result<(), PipelineError> {
        let (query, limit) = if options.full {
            (
                widen_query(&self.config.search_query),
                options.max_messages.unwrap_or(self.config.backfill_max_messages),
            )
        } else {
            (
                self.config.search_query.clone(),
                options.max_messages.unwrap_or(self.config.max_messages),
            )
        };
        tally.query = query.clone();

        let discovered = self.source.list(&query, limit).await.map_err(PipelineError::Source)?;
        state.stats.found = discovered.len() as u64;

        let mut pending = Vec::with_capacity(discovered.len());
        for message in discovered {
            if state.is_processed(&message.id) {
                tally.already_processed += 1;
            } else {
                pending.push(message);
            }
        }
        info!(
            found = state.stats.found,
            pending = pending.len(),
            already_processed = tally.already_processed,
            "discovered messages"
        );

        let stop = self.stop.clone();
        let mut outcomes = stream::iter(pending)
            .take_while(move |_| future::ready(!stop.load(Ordering::SeqCst)))
            .map(|message| self.process_message(message))
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(outcome) = outcomes.next().await {
            record(outcome, state, tally);
        }
        tally.interrupted = self.stop.load(Ordering::SeqCst);
        if tally.interrupted {
            warn!("run interrupted; remaining messages left for the next run");
        }
        Ok(())
    }

    async fn process_message(&self, message: MessageRef) -> MessageOutcome {
        let message_id = message.id;
        let stage = StageCell::new();
        let span = info_span!("message", message_id = %message_id);
        let work = self.process_stages(&message_id, &stage).instrument(span);

        match tokio::time::timeout(self.config.message_budget(), work).await {
            Ok(Ok(outcome)) => MessageOutcome::Loaded { message_id, outcome },
            Ok(Err(failed)) => MessageOutcome::Failed(failed),
            Err(_) => {
                let detail = format!("exceeded the {}s per-message budget", self.config.message_budget_secs);
                MessageOutcome::Failed(failure(&message_id, stage.get(), FailureReason::Timeout, detail))
            }
        }
    }

    async fn process_stages(&self, message_id: &str, stage: &StageCell) -> Result<LoadOutcome, MessageFailure> {
        let fail = |stage: MessageStage, reason: FailureReason, detail: String| failure(message_id, stage, reason, detail);

        let body = self
            .source
            .fetch(message_id)
            .await
            .map_err(|err| fail(MessageStage::Discovered, FailureReason::Source, err.to_string()))?;
        info!(
            subject = body.subject.as_deref().unwrap_or("-"),
            from = body.from.as_deref().unwrap_or("-"),
            "fetched message"
        );

        stage.set(MessageStage::Extracting);
        let link = self
            .resolver
            .resolve(&body.content)
            .map_err(|err| fail(MessageStage::Extracting, FailureReason::NoLink, err.to_string()))?;
        info!(url = %link.url, label = %link.label, "resolved report link");

        stage.set(MessageStage::Downloading);
        let file = self.downloader.fetch(&link, message_id).await.map_err(|err| match err {
            DownloadError::Validation { .. } => {
                fail(MessageStage::Validating, FailureReason::Validation, err.to_string())
            }
            other => fail(MessageStage::Downloading, FailureReason::Download, other.to_string()),
        })?;

        stage.set(MessageStage::Validating);
        self.archive(&file, message_id).await;

        stage.set(MessageStage::Normalizing);
        let table = self
            .normalize(&file, message_id)
            .await
            .map_err(|detail| fail(MessageStage::Normalizing, FailureReason::Parse, detail))?;
        drop(file);
        if table.is_empty() {
            return Err(fail(
                MessageStage::Normalizing,
                FailureReason::Empty,
                "report contains no data rows".to_string(),
            ));
        }
        if !table.dropped_columns.is_empty() {
            info!(dropped = ?table.dropped_columns, "ignored unrecognized columns");
        }

        stage.set(MessageStage::Loading);
        self.gate
            .load_deduplicated(table.rows, self.sink.as_ref())
            .await
            .map_err(|err| {
                let detail = match err.recovery_path() {
                    Some(path) => format!("{err}; batch saved to {}", path.display()),
                    None => err.to_string(),
                };
                fail(MessageStage::Loading, FailureReason::Load, detail)
            })
    }

    /// Best effort: an archive failure never fails the message.
    async fn archive(&self, file: &ValidatedFile, message_id: &str) {
        let bytes = match file.read().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "cannot read report for archival");
                return;
            }
        };
        let processed_at = Utc::now();
        let key = archive_key(
            &self.config.archive_prefix,
            &file.label,
            message_id,
            processed_at,
            file.extension(),
        );
        let metadata = BTreeMap::from([
            ("message_id".to_string(), message_id.to_string()),
            ("page_name".to_string(), file.label.clone()),
            ("processed_at".to_string(), processed_at.to_rfc3339()),
            ("sha256".to_string(), sha256_hex(&bytes)),
            ("source_url".to_string(), file.source_url.clone()),
        ]);
        match self.objects.put(&key, &bytes, &metadata).await {
            Ok(stored) => info!(key = %stored.key, bytes = stored.byte_size, "archived report"),
            Err(err) => warn!(key = %key, error = %format!("{err:#}"), "archiving report failed"),
        }
    }

    async fn normalize(&self, file: &ValidatedFile, message_id: &str) -> Result<Table, String> {
        let path = file.path().to_path_buf();
        let message_id = message_id.to_string();
        let config = self.normalizer.clone();
        tokio::task::spawn_blocking(move || normalize_file(&path, &message_id, &config))
            .await
            .map_err(|err| format!("normalizer task failed: {err}"))?
            .map_err(|err| err.to_string())
    }
}

/// Applies one message outcome to the run state. Only the driving task calls this.
fn record(outcome: MessageOutcome, state: &mut RunState, tally: &mut RunTally) {
    match outcome {
        MessageOutcome::Loaded { message_id, outcome } => {
            info!(
                message_id = %message_id,
                rows_loaded = outcome.rows_loaded,
                duplicates_skipped = outcome.duplicates_skipped,
                "message loaded"
            );
            state.mark_processed(&message_id);
            state.stats.processed += 1;
            state.stats.rows_loaded += outcome.rows_loaded as u64;
            state.stats.duplicates_skipped += outcome.duplicates_skipped as u64;
        }
        MessageOutcome::Failed(failed) => {
            warn!(
                message_id = %failed.message_id,
                stage = ?failed.stage,
                reason = %failed.reason,
                detail = %failed.detail,
                "message failed"
            );
            state.mark_failed(&failed.message_id);
            state.stats.failed += 1;
            tally.failures.push(failed);
        }
    }
}

/// Writes `<reports_dir>/<run_id>/run_summary.json`.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> anyhow::Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(RUN_SUMMARY_FILE);
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// One incremental run per cron expression; overlapping triggers queue on the run lock.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>, crons: &[String]) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating job scheduler")?;
    for cron in crons {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run(RunOptions::default()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        processed = summary.stats.processed,
                        failed = summary.stats.failed,
                        "scheduled run finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("invalid cron expression {cron:?}"))?;
        sched.add(job).await.context("adding scheduled job")?;
        info!(cron = %cron, "scheduled ingestion run");
    }
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_cell_reports_the_last_stage_entered() {
        let cell = StageCell::new();
        assert_eq!(cell.get(), MessageStage::Discovered);
        cell.set(MessageStage::Downloading);
        cell.set(MessageStage::Normalizing);
        assert_eq!(cell.get(), MessageStage::Normalizing);
    }

    #[test]
    fn failures_are_recorded_without_marking_processed() {
        let mut state = RunState::default();
        let mut tally = RunTally::default();
        record(
            MessageOutcome::Failed(failure("m1", MessageStage::Extracting, FailureReason::NoLink, "none".into())),
            &mut state,
            &mut tally,
        );
        record(
            MessageOutcome::Loaded {
                message_id: "m2".to_string(),
                outcome: LoadOutcome {
                    rows_loaded: 3,
                    duplicates_skipped: 1,
                },
            },
            &mut state,
            &mut tally,
        );

        assert!(!state.is_processed("m1"));
        assert!(state.failed_ids.contains("m1"));
        assert!(state.is_processed("m2"));
        assert_eq!(state.stats.failed, 1);
        assert_eq!(state.stats.processed, 1);
        assert_eq!(state.stats.rows_loaded, 3);
        assert_eq!(state.stats.duplicates_skipped, 1);
        assert_eq!(tally.failures.len(), 1);
        assert_eq!(tally.failures[0].reason, FailureReason::NoLink);
    }
}
