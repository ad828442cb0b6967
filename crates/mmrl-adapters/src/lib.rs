//! Upstream-facing adapters: link extraction from notification bodies, report
//! download, spreadsheet validation and normalization into the canonical schema.

pub mod download;
pub mod links;
pub mod normalize;
pub mod validate;

pub use download::{classify_response, download_url_variations, DownloadError, Downloader, ValidatedFile};
pub use links::{LinkError, LinkResolver, LinkStrategy, DEFAULT_REPORT_DOMAIN};
pub use normalize::{
    normalize_file, normalize_header, normalize_sheet, read_sheet, Cell, NormalizerConfig, ParseError,
    RawSheet,
};
pub use validate::{inspect_spreadsheet, validate_spreadsheet, Rejection, SpreadsheetFormat};

pub const CRATE_NAME: &str = "mmrl-adapters";
