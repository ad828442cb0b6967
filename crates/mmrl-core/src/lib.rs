//! Core domain model for the mass-message report loader.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mmrl-core";

/// Column order the table sink expects, independent of the source spreadsheet headers.
pub const CANONICAL_COLUMNS: [&str; 9] = [
    "message_id",
    "sender",
    "sending_time",
    "price",
    "sent",
    "viewed",
    "purchased",
    "earnings",
    "message",
];

pub const LABEL_MAX_LEN: usize = 50;
pub const FALLBACK_LABEL: &str = "report";

/// Opaque handle to one notification returned by the message source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub discovered_at: DateTime<Utc>,
}

impl MessageRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            discovered_at: Utc::now(),
        }
    }
}

/// Raw body of a notification plus the headers worth logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub id: String,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedLink {
    pub url: String,
    /// Filename hint only; never used as a key.
    pub label: String,
}

impl ExtractedLink {
    pub fn new(url: impl Into<String>, raw_label: &str) -> Self {
        let label = sanitize_label(raw_label);
        Self {
            url: url.into(),
            label: if label.is_empty() {
                FALLBACK_LABEL.to_string()
            } else {
                label
            },
        }
    }
}

/// Restricts a label to alphanumerics, `-`, `_` and `.`, replacing everything else with `_`.
pub fn sanitize_label(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(LABEL_MAX_LEN)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    BinaryExcel,
    HtmlPage,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    pub detected_kind: ArtifactKind,
    pub source_url: String,
    pub content_type: Option<String>,
}

/// One row in the canonical schema. Field order matches [`CANONICAL_COLUMNS`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub message_id: String,
    pub sender: String,
    pub sending_time: String,
    pub price: String,
    pub sent: u64,
    pub viewed: u64,
    pub purchased: u64,
    pub earnings: f64,
    pub message: String,
}

impl NormalizedRow {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey::for_row(self)
    }
}

/// `message_id|sending_time`, the only discriminant used for sink-side dedup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeKey(String);

impl CompositeKey {
    pub fn from_parts(message_id: &str, sending_time: &str) -> Self {
        Self(format!("{message_id}|{sending_time}"))
    }

    pub fn for_row(row: &NormalizedRow) -> Self {
        Self::from_parts(&row.message_id, &row.sending_time)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CompositeKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Normalized rows produced from one message's report.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub message_id: String,
    pub rows: Vec<NormalizedRow>,
    /// Source columns with no canonical counterpart.
    pub dropped_columns: Vec<String>,
}

impl Table {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub found: u64,
    pub processed: u64,
    pub failed: u64,
    pub rows_loaded: u64,
    pub duplicates_skipped: u64,
    pub backfill_mode: bool,
}

/// Durable checkpoint of which message ids were loaded or failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(rename = "processed_messages", default)]
    pub processed_ids: BTreeSet<String>,
    #[serde(rename = "failed_messages", default)]
    pub failed_ids: BTreeSet<String>,
    #[serde(default, with = "iso_timestamp")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: RunStats,
}

impl RunState {
    pub fn is_processed(&self, message_id: &str) -> bool {
        self.processed_ids.contains(message_id)
    }

    pub fn mark_processed(&mut self, message_id: &str) {
        self.failed_ids.remove(message_id);
        self.processed_ids.insert(message_id.to_string());
    }

    pub fn mark_failed(&mut self, message_id: &str) {
        self.failed_ids.insert(message_id.to_string());
    }

    /// Forgets every processed and failed id. Used for full reprocessing and `reset_state`.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn begin_run(&mut self, backfill_mode: bool) {
        self.stats = RunStats {
            backfill_mode,
            ..RunStats::default()
        };
    }

    pub fn finish_run(&mut self, at: DateTime<Utc>) {
        self.last_run = Some(at);
    }
}

/// Accepts RFC 3339 as well as the zone-less ISO-8601 form older state documents carry.
mod iso_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Some(naive.and_utc()))
            .map_err(serde::de::Error::custom)
    }
}

/// Where a message was in the ingestion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStage {
    Discovered,
    Extracting,
    Downloading,
    Validating,
    Normalizing,
    Loading,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Source,
    NoLink,
    Download,
    Validation,
    Parse,
    Empty,
    Load,
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::NoLink => "no_link",
            Self::Download => "download",
            Self::Validation => "validation",
            Self::Parse => "parse",
            Self::Empty => "empty",
            Self::Load => "load",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure record for one message, kept for the run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFailure {
    pub message_id: String,
    pub stage: MessageStage,
    pub reason: FailureReason,
    pub detail: String,
}
