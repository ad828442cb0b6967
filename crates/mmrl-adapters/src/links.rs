//! Download-link extraction from notification bodies and report landing pages.

use std::sync::LazyLock;

use mmrl_core::ExtractedLink;
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_REPORT_DOMAIN: &str = "infloww.com";

const TRACKING_HOSTS: [&str; 1] = ["sendgrid.net"];

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("static selector"));
static SCRIPT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script").expect("static selector"));
static RAW_REPORT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s<>"']+(?:xlsx?|export|download|report)[^\s<>"']*"#)
        .expect("static pattern")
});
static SPREADSHEET_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)https?://[^\s<>"']+\.xlsx?"#).expect("static pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("no download link found in message body")]
    NoLinkFound,
}

/// Which heuristic produced a link, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStrategy {
    DownloadAnchor,
    ReportDomainAnchor,
    SpreadsheetAnchor,
    RawUrlScan,
}

#[derive(Debug, Clone)]
struct Anchor {
    href: String,
    text: String,
    download_attr: bool,
}

#[derive(Debug, Clone)]
pub struct LinkResolver {
    report_domain: String,
    media_url: Option<Regex>,
}

impl Default for LinkResolver {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_DOMAIN)
    }
}

impl LinkResolver {
    pub fn new(report_domain: impl Into<String>) -> Self {
        let report_domain = report_domain
            .into()
            .trim()
            .trim_start_matches('.')
            .to_ascii_lowercase();
        let media_url = Regex::new(&format!(
            r"(?i)https://media\.{}/[A-Za-z0-9_\-]+\.xlsx?",
            regex::escape(&report_domain)
        ))
        .ok();
        Self {
            report_domain,
            media_url,
        }
    }

    pub fn report_domain(&self) -> &str {
        &self.report_domain
    }

    pub fn resolve(&self, body: &str) -> Result<ExtractedLink, LinkError> {
        self.resolve_with_strategy(body).map(|(link, _)| link)
    }

    pub fn resolve_with_strategy(&self, body: &str) -> Result<(ExtractedLink, LinkStrategy), LinkError> {
        let anchors = collect_anchors(&Html::parse_document(body));
        let (url, label, strategy) = self
            .match_anchors(&anchors)
            .or_else(|| {
                scan_raw_urls(body)
                    .map(|url| (url, "extracted_report".to_string(), LinkStrategy::RawUrlScan))
            })
            .ok_or(LinkError::NoLinkFound)?;

        let url = unwrap_redirect(&url).unwrap_or(url);
        debug!(?strategy, %url, "resolved download link");
        Ok((ExtractedLink::new(url, &label), strategy))
    }

    /// Looks for the real file behind a landing page. `page_url` is the final URL after redirects.
    pub fn resolve_in_page(&self, html: &str, page_url: &str) -> Option<String> {
        if let Some(inner) = unwrap_redirect(page_url) {
            return Some(inner);
        }

        if let Some(found) = self.media_url.as_ref().and_then(|re| re.find(html)) {
            return Some(found.as_str().to_string());
        }

        if let Some(url) = SPREADSHEET_URL
            .find_iter(html)
            .map(|m| decode_entities(m.as_str()))
            .find(|url| self.is_report_host(url) && !is_tracking_url(url))
        {
            return Some(url);
        }

        let document = Html::parse_document(html);
        let anchors = collect_anchors(&document);
        for anchor in &anchors {
            let wants_file = has_spreadsheet_extension(&anchor.href)
                || anchor.download_attr
                || ["download", "export", "excel"]
                    .iter()
                    .any(|keyword| contains_ci(&anchor.text, keyword));
            if wants_file {
                if let Some(url) = join_url(page_url, &anchor.href) {
                    return Some(url);
                }
            }
        }

        for script in document.select(&SCRIPT) {
            let text = script.text().collect::<String>();
            if let Some(found) = SPREADSHEET_URL.find(&text) {
                return Some(found.as_str().to_string());
            }
        }

        self.match_anchors(&anchors)
            .and_then(|(href, _, _)| join_url(page_url, &href))
            .filter(|url| url != page_url)
    }

    fn match_anchors(&self, anchors: &[Anchor]) -> Option<(String, String, LinkStrategy)> {
        if let Some(anchor) = anchors
            .iter()
            .find(|a| contains_ci(&a.text, "download") || contains_ci(&a.href, "download"))
        {
            return Some((
                anchor.href.clone(),
                label_or(&anchor.text, "unknown_page"),
                LinkStrategy::DownloadAnchor,
            ));
        }

        if let Some(anchor) = anchors.iter().find(|a| self.is_report_host(&a.href)) {
            return Some((
                anchor.href.clone(),
                label_or(&anchor.text, &self.fallback_domain_label()),
                LinkStrategy::ReportDomainAnchor,
            ));
        }

        anchors
            .iter()
            .find(|a| {
                is_absolute_http(&a.href)
                    && (has_spreadsheet_extension(&a.href)
                        || contains_ci(&a.href, "export")
                        || contains_ci(&a.href, "report"))
            })
            .map(|anchor| {
                (
                    anchor.href.clone(),
                    label_or(&anchor.text, "report"),
                    LinkStrategy::SpreadsheetAnchor,
                )
            })
    }

    fn is_report_host(&self, href: &str) -> bool {
        let Ok(url) = Url::parse(href) else {
            return false;
        };
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        host == self.report_domain || host.ends_with(&format!(".{}", self.report_domain))
    }

    fn fallback_domain_label(&self) -> String {
        let stem = self.report_domain.split('.').next().unwrap_or("domain");
        format!("{stem}_report")
    }
}

fn collect_anchors(document: &Html) -> Vec<Anchor> {
    document
        .select(&ANCHOR)
        .filter_map(|node| {
            let href = node.value().attr("href")?.trim();
            if href.is_empty() {
                return None;
            }
            Some(Anchor {
                href: href.to_string(),
                text: node.text().collect::<String>().trim().to_string(),
                download_attr: node.value().attr("download").is_some(),
            })
        })
        .collect()
}

fn scan_raw_urls(body: &str) -> Option<String> {
    RAW_REPORT_URL
        .find(body)
        .map(|found| decode_entities(found.as_str()))
}

/// Prefers the target of a `url=` tracking/redirect wrapper when it points at a spreadsheet.
fn unwrap_redirect(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
        .filter(|inner| is_absolute_http(inner) && has_spreadsheet_extension(inner))
}

fn join_url(base: &str, href: &str) -> Option<String> {
    if is_absolute_http(href) {
        return Some(href.to_string());
    }
    Url::parse(base)
        .ok()?
        .join(href)
        .ok()
        .map(|url| url.to_string())
}

fn is_tracking_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|host| TRACKING_HOSTS.iter().any(|t| host == *t || host.ends_with(&format!(".{t}"))))
        .unwrap_or(false)
}

fn label_or(text: &str, fallback: &str) -> String {
    if text.trim().is_empty() {
        fallback.to_string()
    } else {
        text.trim().to_string()
    }
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&amp;", "&")
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

fn is_absolute_http(href: &str) -> bool {
    let lower = href.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

pub(crate) fn has_spreadsheet_extension(href: &str) -> bool {
    href.to_ascii_lowercase().contains(".xls")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_anchor_yields_url_and_sanitized_label() {
        let body = r#"<a href="https://media.infloww.com/abc123.xlsx">Download Report</a>"#;
        let (link, strategy) = LinkResolver::default().resolve_with_strategy(body).unwrap();
        assert_eq!(link.url, "https://media.infloww.com/abc123.xlsx");
        assert_eq!(link.label, "Download_Report");
        assert_eq!(strategy, LinkStrategy::DownloadAnchor);
    }

    #[test]
    fn download_anchor_beats_report_domain_anchor() {
        let body = r#"
            <p><a href="https://app.infloww.com/dashboard">Open dashboard</a></p>
            <p><a href="https://files.example.net/get?id=9">Download now</a></p>
        "#;
        let link = LinkResolver::default().resolve(body).unwrap();
        assert_eq!(link.url, "https://files.example.net/get?id=9");
        assert_eq!(link.label, "Download_now");
    }

    #[test]
    fn report_domain_anchor_wins_over_generic_spreadsheet_anchor() {
        let body = r#"
            <a href="https://cdn.example.com/weekly.xlsx">weekly</a>
            <a href="https://app.infloww.com/r/123">View</a>
        "#;
        let (link, strategy) = LinkResolver::default().resolve_with_strategy(body).unwrap();
        assert_eq!(link.url, "https://app.infloww.com/r/123");
        assert_eq!(link.label, "View");
        assert_eq!(strategy, LinkStrategy::ReportDomainAnchor);
    }

    #[test]
    fn empty_anchor_text_falls_back_per_strategy() {
        let resolver = LinkResolver::default();
        let domain = resolver
            .resolve(r#"<a href="https://app.infloww.com/r/1"> </a>"#)
            .unwrap();
        assert_eq!(domain.label, "infloww_report");

        let (sheet, strategy) = resolver
            .resolve_with_strategy(r#"<a href="https://cdn.example.com/files/weekly.XLSX"></a>"#)
            .unwrap();
        assert_eq!(sheet.label, "report");
        assert_eq!(strategy, LinkStrategy::SpreadsheetAnchor);
    }

    #[test]
    fn relative_anchors_without_keywords_are_ignored() {
        let body = r#"<a href="/settings">Settings</a><a href="mailto:x@y.z">Mail</a>"#;
        assert_eq!(LinkResolver::default().resolve(body), Err(LinkError::NoLinkFound));
    }

    #[test]
    fn raw_scan_finds_urls_in_plain_text() {
        let body = "Your export is ready: https://cdn.example.com/export?id=7&amp;t=2 (expires soon)";
        let (link, strategy) = LinkResolver::default().resolve_with_strategy(body).unwrap();
        assert_eq!(link.url, "https://cdn.example.com/export?id=7&t=2");
        assert_eq!(link.label, "extracted_report");
        assert_eq!(strategy, LinkStrategy::RawUrlScan);
    }

    #[test]
    fn tracking_wrapper_is_unwrapped_to_inner_spreadsheet_url() {
        let body = r#"<a href="https://u1.ct.sendgrid.net/ls/click?url=https%3A%2F%2Fmedia.infloww.com%2Fabc.xlsx&amp;upn=x">Download</a>"#;
        let link = LinkResolver::default().resolve(body).unwrap();
        assert_eq!(link.url, "https://media.infloww.com/abc.xlsx");
    }

    #[test]
    fn tracking_wrapper_without_spreadsheet_target_is_kept() {
        let body = r#"<a href="https://t.example.com/c?url=https%3A%2F%2Fexample.com%2Fhome">Download</a>"#;
        let link = LinkResolver::default().resolve(body).unwrap();
        assert!(link.url.starts_with("https://t.example.com/c?url="));
    }

    #[test]
    fn no_link_in_body_is_an_error() {
        assert_eq!(
            LinkResolver::default().resolve("<p>Hello there</p>"),
            Err(LinkError::NoLinkFound)
        );
    }

    #[test]
    fn landing_page_media_url_is_found() {
        let html = r#"<html><body><div data-src="https://media.infloww.com/5f2a-99.xlsx"></div></body></html>"#;
        let found = LinkResolver::default().resolve_in_page(html, "https://app.infloww.com/landing");
        assert_eq!(found.as_deref(), Some("https://media.infloww.com/5f2a-99.xlsx"));
    }

    #[test]
    fn landing_page_relative_file_anchor_is_joined() {
        let html = r#"<html><body><a href="../files/report.xlsx">here</a></body></html>"#;
        let found = LinkResolver::default().resolve_in_page(html, "https://host.example/a/b/page");
        assert_eq!(found.as_deref(), Some("https://host.example/a/files/report.xlsx"));
    }

    #[test]
    fn landing_page_url_parameter_takes_precedence() {
        let found = LinkResolver::default().resolve_in_page(
            "<html></html>",
            "https://app.infloww.com/dl?url=https%3A%2F%2Fmedia.infloww.com%2Fq.xlsx",
        );
        assert_eq!(found.as_deref(), Some("https://media.infloww.com/q.xlsx"));
    }

    #[test]
    fn landing_page_script_urls_are_found() {
        let html = r#"<html><script>window.location = "https://cdn.example.com/out.xls";</script></html>"#;
        let found = LinkResolver::default().resolve_in_page(html, "https://cdn.example.com/page");
        assert_eq!(found.as_deref(), Some("https://cdn.example.com/out.xls"));
    }

    #[test]
    fn landing_page_without_links_yields_nothing() {
        let html = "<!DOCTYPE html><html><body><p>Preparing your file</p></body></html>";
        assert!(LinkResolver::default()
            .resolve_in_page(html, "https://app.infloww.com/view")
            .is_none());
    }
}
