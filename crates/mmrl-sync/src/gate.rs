//! Composite-key dedup in front of the table sink, with Parquet recovery dumps.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::Utc;
use mmrl_core::{CompositeKey, NormalizedRow};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::sink::{SinkError, TableSink};

pub const EXISTENCE_CHUNK: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    pub rows_loaded: usize,
    pub duplicates_skipped: usize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("preparing destination failed: {source}")]
    Container {
        #[source]
        source: SinkError,
        recovery: Option<PathBuf>,
    },
    #[error("appending {rows} rows failed: {source}")]
    Append {
        rows: usize,
        #[source]
        source: SinkError,
        recovery: Option<PathBuf>,
    },
}

impl LoadError {
    /// Parquet file holding the batch that could not be loaded.
    pub fn recovery_path(&self) -> Option<&Path> {
        match self {
            Self::Container { recovery, .. } | Self::Append { recovery, .. } => recovery.as_deref(),
        }
    }
}

pub struct DedupLoadGate {
    recovery_dir: PathBuf,
    chunk_size: usize,
}

impl DedupLoadGate {
    pub fn new(recovery_dir: impl Into<PathBuf>) -> Self {
        Self {
            recovery_dir: recovery_dir.into(),
            chunk_size: EXISTENCE_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub async fn load_deduplicated(
        &self,
        rows: Vec<NormalizedRow>,
        sink: &dyn TableSink,
    ) -> Result<LoadOutcome, LoadError> {
        let total = rows.len();
        if total == 0 {
            return Ok(LoadOutcome::default());
        }

        let keys: Vec<CompositeKey> = rows.iter().map(NormalizedRow::composite_key).collect();
        let existing = self.existing_keys(&keys, sink).await;
        let fresh: Vec<NormalizedRow> = rows
            .into_iter()
            .zip(keys)
            .filter(|(_, key)| !existing.contains(key))
            .map(|(row, _)| row)
            .collect();
        let duplicates_skipped = total - fresh.len();

        if fresh.is_empty() {
            info!(duplicates_skipped, "every row already loaded");
            return Ok(LoadOutcome {
                rows_loaded: 0,
                duplicates_skipped,
            });
        }

        if let Err(source) = sink.ensure_container_exists().await {
            let recovery = self.dump(&fresh);
            return Err(LoadError::Container { source, recovery });
        }

        match sink.append(&fresh).await {
            Ok(rows_loaded) => {
                info!(rows_loaded, duplicates_skipped, "loaded rows");
                Ok(LoadOutcome {
                    rows_loaded,
                    duplicates_skipped,
                })
            }
            Err(source) => {
                let recovery = self.dump(&fresh);
                Err(LoadError::Append {
                    rows: fresh.len(),
                    source,
                    recovery,
                })
            }
        }
    }

    /// Fails open: any lookup error means nothing is treated as a duplicate.
    async fn existing_keys(&self, keys: &[CompositeKey], sink: &dyn TableSink) -> HashSet<CompositeKey> {
        let unique: Vec<CompositeKey> = keys
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .cloned()
            .collect();
        let mut existing = HashSet::new();
        for chunk in unique.chunks(self.chunk_size) {
            match sink.query_existing_keys(chunk).await {
                Ok(found) => existing.extend(found),
                Err(err) => {
                    warn!(error = %err, "existence check failed; loading without dedup");
                    return HashSet::new();
                }
            }
        }
        existing
    }

    fn dump(&self, rows: &[NormalizedRow]) -> Option<PathBuf> {
        match write_recovery_batch(&self.recovery_dir, rows) {
            Ok(path) => {
                warn!(path = %path.display(), rows = rows.len(), "wrote recovery batch");
                Some(path)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to write recovery batch");
                None
            }
        }
    }
}

fn text_column(rows: &[NormalizedRow], field: fn(&NormalizedRow) -> &str) -> StringArray {
    StringArray::from(rows.iter().map(field).collect::<Vec<_>>())
}

fn count_column(rows: &[NormalizedRow], field: fn(&NormalizedRow) -> u64) -> UInt64Array {
    UInt64Array::from(rows.iter().map(field).collect::<Vec<_>>())
}

/// Serializes rows that could not be loaded so they can be replayed by hand.
pub fn write_recovery_batch(dir: &Path, rows: &[NormalizedRow]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!(
        "failed_load_{}_{}.parquet",
        Utc::now().format("%Y%m%d_%H%M%S"),
        Uuid::new_v4().simple()
    ));

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("message_id", DataType::Utf8, false),
        ArrowField::new("sender", DataType::Utf8, false),
        ArrowField::new("sending_time", DataType::Utf8, false),
        ArrowField::new("price", DataType::Utf8, false),
        ArrowField::new("sent", DataType::UInt64, false),
        ArrowField::new("viewed", DataType::UInt64, false),
        ArrowField::new("purchased", DataType::UInt64, false),
        ArrowField::new("earnings", DataType::Float64, false),
        ArrowField::new("message", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(text_column(rows, |r| r.message_id.as_str())),
            Arc::new(text_column(rows, |r| r.sender.as_str())),
            Arc::new(text_column(rows, |r| r.sending_time.as_str())),
            Arc::new(text_column(rows, |r| r.price.as_str())),
            Arc::new(count_column(rows, |r| r.sent)),
            Arc::new(count_column(rows, |r| r.viewed)),
            Arc::new(count_column(rows, |r| r.purchased)),
            Arc::new(Float64Array::from(rows.iter().map(|r| r.earnings).collect::<Vec<_>>())),
            Arc::new(text_column(rows, |r| r.message.as_str())),
        ],
    )
    .context("building recovery record batch")?;

    let file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(path)
}
