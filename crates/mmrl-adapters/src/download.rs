//! Report download: direct fetch, one landing-page hop, URL variations, then validation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mmrl_core::{sanitize_label, ArtifactKind, ExtractedLink, FetchedArtifact, FALLBACK_LABEL};
use mmrl_storage::{FetchError, FetchedResponse, HttpFetcher};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use url::Url;

use crate::links::LinkResolver;
use crate::validate::{has_zip_signature, inspect_spreadsheet, Rejection, SpreadsheetFormat};

const HTML_SNIFF_LEN: usize = 100;
const BINARY_MIME_MARKERS: [&str; 3] = [
    "spreadsheetml",
    "application/vnd.ms-excel",
    "application/octet-stream",
];

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed for {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("file downloaded from {url} failed validation: {reason}")]
    Validation {
        url: String,
        reason: Rejection,
        /// Where the rejected bytes were moved for inspection, if the move succeeded.
        kept_at: Option<PathBuf>,
    },
    #[error("writing downloaded file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn classify_response(response: &FetchedResponse) -> ArtifactKind {
    let content_type = response
        .content_type
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let attachment = response
        .content_disposition
        .as_deref()
        .is_some_and(|value| value.to_ascii_lowercase().contains("attachment"));

    if BINARY_MIME_MARKERS.iter().any(|m| content_type.contains(m))
        || attachment
        || has_zip_signature(&response.body)
    {
        return ArtifactKind::BinaryExcel;
    }

    let head = &response.body[..response.body.len().min(HTML_SNIFF_LEN)];
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    if content_type.contains("text/html") || head.contains("<!doctype html") || head.contains("<html") {
        return ArtifactKind::HtmlPage;
    }
    ArtifactKind::Unknown
}

fn into_artifact(response: FetchedResponse) -> FetchedArtifact {
    let detected_kind = classify_response(&response);
    FetchedArtifact {
        detected_kind,
        source_url: response.final_url,
        content_type: response.content_type,
        bytes: response.body,
    }
}

fn is_spreadsheet_mime(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    lower.contains("spreadsheet") || lower.contains("application/vnd.ms-excel")
}

/// Candidate download endpoints derived from a landing page URL, in the order they are tried.
pub fn download_url_variations(page_url: &str) -> Vec<String> {
    let Ok(parsed) = Url::parse(page_url) else {
        return Vec::new();
    };
    let path = parsed.path().trim_end_matches('/').to_string();
    let mut variations = Vec::new();

    if !path.contains("/download") {
        let mut candidate = parsed.clone();
        candidate.set_path(&format!("{path}/download"));
        variations.push(candidate.to_string());
    }
    if path.contains("/view") {
        let mut candidate = parsed.clone();
        candidate.set_path(&path.replacen("/view", "/download", 1));
        variations.push(candidate.to_string());
    }
    for (key, value) in [("export", "true"), ("format", "xlsx")] {
        let mut candidate = parsed.clone();
        candidate.query_pairs_mut().append_pair(key, value);
        variations.push(candidate.to_string());
    }

    let mut seen = Vec::with_capacity(variations.len());
    for candidate in variations {
        if candidate != page_url && !seen.contains(&candidate) {
            seen.push(candidate);
        }
    }
    seen
}

#[derive(Debug)]
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove temporary download");
            }
        }
    }
}

/// A downloaded file that passed validation. The file is deleted when this value drops.
#[derive(Debug)]
pub struct ValidatedFile {
    guard: TempFileGuard,
    pub label: String,
    pub source_url: String,
    pub byte_size: u64,
    pub format: SpreadsheetFormat,
}

impl ValidatedFile {
    pub fn path(&self) -> &Path {
        &self.guard.path
    }

    pub fn extension(&self) -> &'static str {
        match self.format {
            SpreadsheetFormat::Xlsx => "xlsx",
            SpreadsheetFormat::Xls => "xls",
        }
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        fs::read(self.path()).await
    }
}

pub struct Downloader {
    http: Arc<HttpFetcher>,
    resolver: LinkResolver,
    work_dir: PathBuf,
}

impl Downloader {
    pub fn new(http: Arc<HttpFetcher>, resolver: LinkResolver, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            resolver,
            work_dir: work_dir.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.work_dir.join("rejected")
    }

    pub async fn fetch(&self, link: &ExtractedLink, message_id: &str) -> Result<ValidatedFile, DownloadError> {
        let first = self
            .http
            .fetch_bytes(message_id, &link.url)
            .await
            .map_err(|source| DownloadError::Request {
                url: link.url.clone(),
                source,
            })?;
        let artifact = self.locate_binary(into_artifact(first), message_id).await;
        self.persist_and_validate(artifact, link, message_id).await
    }

    /// Returns the first binary artifact found, or the last response received when none is.
    async fn locate_binary(&self, first: FetchedArtifact, message_id: &str) -> FetchedArtifact {
        if first.detected_kind == ArtifactKind::BinaryExcel {
            return first;
        }

        let page_url = first.source_url.clone();
        let mut last = first;

        if last.detected_kind == ArtifactKind::HtmlPage {
            let html = String::from_utf8_lossy(&last.bytes).into_owned();
            if let Some(candidate) = self.resolver.resolve_in_page(&html, &page_url) {
                debug!(%candidate, "following link embedded in landing page");
                match self.http.fetch_bytes(message_id, &candidate).await {
                    Ok(response) => {
                        let hop = into_artifact(response);
                        if hop.detected_kind == ArtifactKind::BinaryExcel {
                            return hop;
                        }
                        last = hop;
                    }
                    Err(err) => warn!(%candidate, error = %err, "landing page link failed"),
                }
            } else {
                debug!(%page_url, "landing page carries no download link");
            }
        }

        for candidate in download_url_variations(&page_url) {
            match self.http.fetch_bytes(message_id, &candidate).await {
                Ok(response) => {
                    let attempt = into_artifact(response);
                    let spreadsheet_type = attempt
                        .content_type
                        .as_deref()
                        .is_some_and(is_spreadsheet_mime);
                    if has_zip_signature(&attempt.bytes) || spreadsheet_type {
                        info!(%candidate, "download URL variation succeeded");
                        return attempt;
                    }
                    last = attempt;
                }
                Err(err) => debug!(%candidate, error = %err, "download URL variation failed"),
            }
        }

        last
    }

    async fn persist_and_validate(
        &self,
        artifact: FetchedArtifact,
        link: &ExtractedLink,
        message_id: &str,
    ) -> Result<ValidatedFile, DownloadError> {
        fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|source| DownloadError::Io {
                path: self.work_dir.clone(),
                source,
            })?;

        let label = if link.label.trim().is_empty() {
            FALLBACK_LABEL.to_string()
        } else {
            link.label.clone()
        };
        let path = self
            .work_dir
            .join(format!("{label}_{}.xlsx", sanitize_label(message_id)));
        fs::write(&path, &artifact.bytes)
            .await
            .map_err(|source| DownloadError::Io {
                path: path.clone(),
                source,
            })?;
        let mut guard = TempFileGuard { path, armed: true };

        match inspect_spreadsheet(&guard.path).await {
            Ok(format) => {
                info!(
                    message_id,
                    url = %artifact.source_url,
                    bytes = artifact.bytes.len(),
                    ?format,
                    "downloaded report"
                );
                Ok(ValidatedFile {
                    guard,
                    label,
                    source_url: artifact.source_url,
                    byte_size: artifact.bytes.len() as u64,
                    format,
                })
            }
            Err(reason) => {
                warn!(message_id, url = %artifact.source_url, %reason, "downloaded file rejected");
                let kept_at = self.quarantine(&mut guard).await;
                Err(DownloadError::Validation {
                    url: artifact.source_url,
                    reason,
                    kept_at,
                })
            }
        }
    }

    async fn quarantine(&self, guard: &mut TempFileGuard) -> Option<PathBuf> {
        let dir = self.rejected_dir();
        if let Err(err) = fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %err, "cannot create rejected directory");
            return None;
        }
        let target = dir.join(guard.path.file_name()?);
        match fs::rename(&guard.path, &target).await {
            Ok(()) => {
                guard.disarm();
                Some(target)
            }
            Err(err) => {
                warn!(target = %target.display(), error = %err, "cannot keep rejected download");
                None
            }
        }
    }
}
