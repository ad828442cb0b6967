//! Spreadsheet file validation before parsing.

use std::path::Path;

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::warn;

pub const MIN_SPREADSHEET_BYTES: u64 = 100;

const ZIP_MAGIC: &[u8] = b"PK";
const OLE2_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const HTML_MARKERS: [&str; 4] = ["<!doctype html", "<html", "<head>", "<body>"];
const SNIFF_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadsheetFormat {
    /// Office Open XML (zip container).
    Xlsx,
    /// Legacy BIFF inside an OLE2 compound document.
    Xls,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("file does not exist")]
    Missing,
    #[error("file is empty")]
    Empty,
    #[error("file is too small to be a spreadsheet ({0} bytes)")]
    TooSmall(u64),
    #[error("unexpected file extension {0:?}")]
    WrongExtension(String),
    #[error("file contains HTML instead of a spreadsheet")]
    HtmlContent,
    #[error("file signature is neither zip nor OLE2")]
    UnknownSignature,
    #[error("file could not be read: {0}")]
    Unreadable(String),
}

pub(crate) fn has_zip_signature(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

pub(crate) fn looks_like_html(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(&head[..head.len().min(SNIFF_LEN)]).to_lowercase();
    HTML_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Checks in order: exists, non-empty, minimum size, extension, HTML content, magic bytes.
pub async fn inspect_spreadsheet(path: &Path) -> Result<SpreadsheetFormat, Rejection> {
    let meta = match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Err(Rejection::Missing),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(Rejection::Missing),
        Err(err) => return Err(Rejection::Unreadable(err.to_string())),
    };

    let size = meta.len();
    if size == 0 {
        return Err(Rejection::Empty);
    }
    if size < MIN_SPREADSHEET_BYTES {
        return Err(Rejection::TooSmall(size));
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if extension != "xlsx" && extension != "xls" {
        return Err(Rejection::WrongExtension(extension));
    }

    let mut head = Vec::with_capacity(SNIFF_LEN);
    let mut file = fs::File::open(path)
        .await
        .map_err(|err| Rejection::Unreadable(err.to_string()))?;
    (&mut file)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .await
        .map_err(|err| Rejection::Unreadable(err.to_string()))?;

    if looks_like_html(&head) {
        return Err(Rejection::HtmlContent);
    }
    if has_zip_signature(&head) {
        return Ok(SpreadsheetFormat::Xlsx);
    }
    if head.starts_with(&OLE2_MAGIC) {
        return Ok(SpreadsheetFormat::Xls);
    }
    Err(Rejection::UnknownSignature)
}

pub async fn validate_spreadsheet(path: &Path) -> bool {
    match inspect_spreadsheet(path).await {
        Ok(_) => true,
        Err(reason) => {
            warn!(path = %path.display(), %reason, "spreadsheet validation failed");
            false
        }
    }
}
