//! Object storage, run-state persistence and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mmrl_core::{sanitize_label, RunState};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mmrl-storage";

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Object key for an archived report: `<prefix>/<label>_<message_id>_<YYYYmmdd_HHMMSS>.<ext>`.
///
/// Labels repeat across notifications, so the message id keeps keys unique per report.
pub fn archive_key(
    prefix: &str,
    label: &str,
    message_id: &str,
    archived_at: DateTime<Utc>,
    extension: &str,
) -> String {
    let stamp = archived_at.format("%Y%m%d_%H%M%S").to_string();
    let id = sanitize_label(message_id);
    let ext = extension.trim_start_matches('.').trim();
    let ext = if ext.is_empty() { "bin" } else { ext };
    let name = format!("{label}_{id}_{stamp}.{ext}");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub location: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> anyhow::Result<StoredObject>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Filesystem-backed object store. Metadata lands in a `<key>.meta.json` sidecar.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(key);
        if key.trim().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            anyhow::bail!("invalid object key {key:?}");
        }
        Ok(self.root.join(relative))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".meta.json");
        path.with_file_name(name)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> anyhow::Result<StoredObject> {
        let path = self.path_for(key)?;
        write_atomic(&path, bytes).await?;
        if !metadata.is_empty() {
            let sidecar = serde_json::to_vec_pretty(metadata).context("serializing object metadata")?;
            write_atomic(&Self::sidecar_path(&path), &sidecar).await?;
        }
        Ok(StoredObject {
            key: key.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
            location: path.display().to_string(),
        })
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading object {}", path.display())),
        }
    }
}

/// Writes through a temp file in the same directory and renames it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("object path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating object directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp object {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("reading run state {key}: {message}")]
    Read { key: String, message: String },
    #[error("run state {key} is not a valid document: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing run state {key}: {message}")]
    Write { key: String, message: String },
}

/// Run state kept as one JSON document at a fixed object key.
#[derive(Clone)]
pub struct RunStateStore {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl RunStateStore {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// `Ok(None)` when no document has been written yet.
    pub async fn load(&self) -> Result<Option<RunState>, StateError> {
        let bytes = self.store.get(&self.key).await.map_err(|err| StateError::Read {
            key: self.key.clone(),
            message: format!("{err:#}"),
        })?;
        let Some(bytes) = bytes else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StateError::Corrupt {
                key: self.key.clone(),
                source,
            })
    }

    pub async fn save(&self, state: &RunState) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|err| StateError::Write {
            key: self.key.clone(),
            message: err.to_string(),
        })?;
        let metadata = BTreeMap::from([(
            "content_type".to_string(),
            "application/json".to_string(),
        )]);
        self.store
            .put(&self.key, &bytes, &metadata)
            .await
            .map_err(|err| StateError::Write {
                key: self.key.clone(),
                message: format!("{err:#}"),
            })?;
        Ok(())
    }
}

/// How the report host answered a download request that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostVerdict {
    /// Overloaded or throttling; the same URL may work shortly.
    Busy,
    /// The signed report link is no longer honoured. Retrying the same URL never helps.
    LinkExpired,
    Rejected,
}

pub fn host_verdict(status: StatusCode) -> HostVerdict {
    match status.as_u16() {
        401 | 403 | 410 => HostVerdict::LinkExpired,
        408 | 425 | 429 | 500..=599 => HostVerdict::Busy,
        _ => HostVerdict::Rejected,
    }
}

/// Seconds form of `Retry-After`; the HTTP-date form is ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Retries for a busy or unreachable report host. Timeouts are never retried: a report that
/// took the whole request timeout once would eat the per-message budget on a second try.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Pause before retry number `attempt` (0-based). The host's hint wins over the doubling
    /// schedule; either way the pause is capped at `max_delay`.
    pub fn pause(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        let doubled = self.base_delay.saturating_mul(1u32 << attempt.min(16) as u32);
        hint.unwrap_or(doubled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub global_concurrency: usize,
    pub max_redirects: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: BROWSER_USER_AGENT.to_string(),
            global_concurrency: 8,
            max_redirects: 10,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("report link expired or forbidden (http {status}) for {url}")]
    LinkExpired { status: u16, url: String },
    #[error("fetcher is shut down")]
    ShutDown,
}

/// GET client that presents itself as a browser; report hosts reject bare clients.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, message_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::ShutDown)?;

        let span = info_span!("http_fetch", message_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let pause = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return read_report(resp).await,
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    match host_verdict(status) {
                        HostVerdict::LinkExpired => {
                            return Err(FetchError::LinkExpired {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                        HostVerdict::Busy if attempt < self.backoff.max_retries => {
                            let pause = self.backoff.pause(attempt, retry_after(resp.headers()));
                            warn!(status = status.as_u16(), attempt, ?pause, "report host busy; backing off");
                            pause
                        }
                        _ => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            })
                        }
                    }
                }
                Err(err) if err.is_connect() && attempt < self.backoff.max_retries => {
                    let pause = self.backoff.pause(attempt, None);
                    warn!(error = %err, attempt, ?pause, "report host unreachable; backing off");
                    pause
                }
                Err(err) => return Err(FetchError::Request(err)),
            };
            tokio::time::sleep(pause).await;
            attempt += 1;
        }
    }
}

async fn read_report(resp: reqwest::Response) -> Result<FetchedResponse, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    let content_type = header_string(resp.headers(), header::CONTENT_TYPE);
    let content_disposition = header_string(resp.headers(), header::CONTENT_DISPOSITION);
    let body = resp.bytes().await?.to_vec();
    debug!(status = status.as_u16(), bytes = body.len(), final_url = %final_url, "fetched");
    Ok(FetchedResponse {
        status,
        final_url,
        content_type,
        content_disposition,
        body,
    })
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
