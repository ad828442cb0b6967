//! Notification sources: the Gmail REST API and a local spool directory.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::DateTime;
use mmrl_core::{MessageBody, MessageRef};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com";
const GMAIL_PAGE_LIMIT: usize = 500;
const SPOOL_EXTENSIONS: [&str; 3] = ["html", "htm", "txt"];

static NEWER_THAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*newer_than:\w+").expect("static pattern"));

/// Drops every `newer_than:` clause so a backfill sees the whole mailbox history.
pub fn widen_query(query: &str) -> String {
    NEWER_THAN.replace_all(query, "").trim().to_string()
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("message source request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("message source returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("message {0} not found")]
    NotFound(String),
    #[error("message {0} has no readable body")]
    EmptyBody(String),
    #[error("reading spool {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn list(&self, query: &str, max_results: usize) -> Result<Vec<MessageRef>, SourceError>;

    async fn fetch(&self, id: &str) -> Result<MessageBody, SourceError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<ListedMessage>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    internal_date: Option<String>,
    #[serde(default)]
    payload: MessagePart,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<PartHeader>,
    #[serde(default)]
    body: PartBody,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
struct PartHeader {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct PartBody {
    data: Option<String>,
}

impl MessagePart {
    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }

    fn find_mime(&self, mime: &str) -> Option<&MessagePart> {
        if self.mime_type.eq_ignore_ascii_case(mime) && self.body.data.is_some() {
            return Some(self);
        }
        self.parts.iter().find_map(|part| part.find_mime(mime))
    }

    /// HTML part first, then plain text, then whatever the top-level body carries.
    fn content(&self) -> String {
        self.find_mime("text/html")
            .or_else(|| self.find_mime("text/plain"))
            .and_then(|part| part.body.data.as_deref())
            .or(self.body.data.as_deref())
            .and_then(decode_base64url)
            .unwrap_or_default()
    }
}

fn decode_base64url(data: &str) -> Option<String> {
    let cleaned: String = data
        .trim()
        .trim_end_matches('=')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    URL_SAFE_NO_PAD
        .decode(cleaned)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn non_empty(body: MessageBody) -> Result<MessageBody, SourceError> {
    if body.content.trim().is_empty() {
        return Err(SourceError::EmptyBody(body.id));
    }
    Ok(body)
}

fn into_body(message: GmailMessage) -> MessageBody {
    let internal_date = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis);
    MessageBody {
        subject: message.payload.header("Subject"),
        from: message.payload.header("From"),
        content: message.payload.content(),
        internal_date,
        id: message.id,
    }
}

/// Gmail REST connector. The bearer token is obtained elsewhere and handed in ready to use.
pub struct GmailMessageSource {
    client: reqwest::Client,
    api_base: String,
    user_id: String,
    access_token: String,
}

impl GmailMessageSource {
    pub fn new(
        api_base: impl Into<String>,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            access_token: access_token.into(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/gmail/v1/users/{}/messages", self.api_base, self.user_id)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl MessageSource for GmailMessageSource {
    async fn list(&self, query: &str, max_results: usize) -> Result<Vec<MessageRef>, SourceError> {
        let url = self.messages_url();
        let mut refs = Vec::new();
        let mut page_token: Option<String> = None;

        while refs.len() < max_results {
            let remaining = (max_results - refs.len()).min(GMAIL_PAGE_LIMIT);
            let mut params = vec![("q", query.to_string()), ("maxResults", remaining.to_string())];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: ListResponse = self.get_json(&url, &params).await?;
            debug!(count = page.messages.len(), "listed message page");
            refs.extend(page.messages.into_iter().map(|m| MessageRef::new(m.id)));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        refs.truncate(max_results);
        info!(query, found = refs.len(), "discovered messages");
        Ok(refs)
    }

    async fn fetch(&self, id: &str) -> Result<MessageBody, SourceError> {
        let url = format!("{}/{}", self.messages_url(), id);
        match self
            .get_json::<GmailMessage>(&url, &[("format", "full".to_string())])
            .await
        {
            Ok(message) => non_empty(into_body(message)),
            Err(SourceError::Api { status: 404, .. }) => Err(SourceError::NotFound(id.to_string())),
            Err(err) => Err(err),
        }
    }
}

/// Reads notification bodies from `<dir>/<id>.html` (or `.htm`/`.txt`). The query is ignored.
#[derive(Debug, Clone)]
pub struct SpoolMessageSource {
    dir: PathBuf,
}

impl SpoolMessageSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn io_error(&self, source: std::io::Error) -> SourceError {
        SourceError::Io {
            path: self.dir.clone(),
            source,
        }
    }
}

#[async_trait]
impl MessageSource for SpoolMessageSource {
    async fn list(&self, _query: &str, max_results: usize) -> Result<Vec<MessageRef>, SourceError> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| self.io_error(e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(e))? {
            let path = entry.path();
            let spooled = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SPOOL_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if !spooled {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !ids.iter().any(|id: &String| id == stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        ids.truncate(max_results);
        Ok(ids.into_iter().map(MessageRef::new).collect())
    }

    async fn fetch(&self, id: &str) -> Result<MessageBody, SourceError> {
        for ext in SPOOL_EXTENSIONS {
            let path = self.dir.join(format!("{id}.{ext}"));
            match fs::read(&path).await {
                Ok(bytes) => {
                    return non_empty(MessageBody {
                        id: id.to_string(),
                        subject: None,
                        from: None,
                        internal_date: None,
                        content: String::from_utf8_lossy(&bytes).into_owned(),
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(SourceError::Io { path, source }),
            }
        }
        Err(SourceError::NotFound(id.to_string()))
    }
}
