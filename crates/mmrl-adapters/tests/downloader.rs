use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use mmrl_adapters::{DownloadError, Downloader, LinkResolver, Rejection, SpreadsheetFormat};
use mmrl_core::ExtractedLink;
use mmrl_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use rust_xlsxwriter::Workbook;
use tokio::net::TcpListener;

const XLSX_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

type Routes = HashMap<String, (&'static str, Vec<u8>)>;

#[derive(Clone)]
struct Fixture {
    routes: Arc<Routes>,
    hits: Arc<Mutex<Vec<String>>>,
}

async fn serve_fixture(State(fixture): State<Fixture>, request: Request) -> Response {
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    fixture.hits.lock().unwrap().push(target.clone());
    match fixture.routes.get(&target) {
        Some((content_type, body)) => ([(header::CONTENT_TYPE, *content_type)], body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Binds first so route bodies can reference the server's own base URL.
async fn start_server(build: impl FnOnce(&str) -> Routes) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let fixture = Fixture {
        routes: Arc::new(build(&base)),
        hits: Arc::default(),
    };
    let hits = fixture.hits.clone();
    let app = Router::new().fallback(serve_fixture).with_state(fixture);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base, hits)
}

fn workbook_bytes() -> Vec<u8> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Sender").unwrap();
    sheet.write_string(0, 1, "Sending Time").unwrap();
    sheet.write_string(1, 0, "alice").unwrap();
    sheet.write_string(1, 1, "2024-01-01 00:00:00").unwrap();
    workbook.save_to_buffer().unwrap()
}

fn downloader(work_dir: &std::path::Path) -> Downloader {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        backoff: BackoffPolicy::none(),
        ..HttpClientConfig::default()
    })
    .unwrap();
    Downloader::new(Arc::new(http), LinkResolver::default(), work_dir)
}

fn hits(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn direct_spreadsheet_is_accepted_and_cleaned_up_on_drop() {
    let (base, log) = start_server(|_| {
        Routes::from([("/files/r.xlsx".to_string(), (XLSX_TYPE, workbook_bytes()))])
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let link = ExtractedLink::new(format!("{base}/files/r.xlsx"), "Download Report");

    let file = downloader(dir.path()).fetch(&link, "m1").await.unwrap();
    let path = file.path().to_path_buf();

    assert_eq!(path.file_name().unwrap(), "Download_Report_m1.xlsx");
    assert_eq!(file.format, SpreadsheetFormat::Xlsx);
    assert_eq!(file.read().await.unwrap(), workbook_bytes());
    assert_eq!(hits(&log), vec!["/files/r.xlsx"]);

    drop(file);
    assert!(!path.exists());
}

#[tokio::test]
async fn landing_page_link_is_followed_once() {
    let (base, log) = start_server(|_| {
        Routes::from([
            (
                "/landing".to_string(),
                (
                    "text/html",
                    br#"<html><body><a href="/files/r.xlsx">Export to Excel</a></body></html>"#.to_vec(),
                ),
            ),
            ("/files/r.xlsx".to_string(), ("application/octet-stream", workbook_bytes())),
        ])
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let link = ExtractedLink::new(format!("{base}/landing"), "report");

    let file = downloader(dir.path()).fetch(&link, "m2").await.unwrap();

    assert!(file.source_url.ends_with("/files/r.xlsx"));
    assert_eq!(hits(&log), vec!["/landing", "/files/r.xlsx"]);
}

#[tokio::test]
async fn page_without_links_falls_back_to_url_variations() {
    let (base, log) = start_server(|_| {
        Routes::from([
            (
                "/report/view".to_string(),
                ("text/html", b"<!DOCTYPE html><html><body>Preparing</body></html>".to_vec()),
            ),
            ("/report/download".to_string(), ("application/octet-stream", workbook_bytes())),
        ])
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let link = ExtractedLink::new(format!("{base}/report/view"), "View");

    let file = downloader(dir.path()).fetch(&link, "m3").await.unwrap();

    assert!(file.source_url.ends_with("/report/download"));
    assert_eq!(
        hits(&log),
        vec!["/report/view", "/report/view/download", "/report/download"]
    );
}

#[tokio::test]
async fn exhausted_variations_keep_rejected_file() {
    let page = format!(
        "<!DOCTYPE html><html><body>{}</body></html>",
        "still preparing ".repeat(20)
    );
    let (base, log) = start_server(move |_| {
        Routes::from([("/r".to_string(), ("text/html", page.into_bytes()))])
    })
    .await;
    let dir = tempfile::tempdir().unwrap();
    let link = ExtractedLink::new(format!("{base}/r"), "");

    let err = downloader(dir.path()).fetch(&link, "m4").await.unwrap_err();

    let (reason, kept_at) = match err {
        DownloadError::Validation { reason, kept_at, .. } => (reason, kept_at),
        other => panic!("expected a validation failure, got {other:?}"),
    };
    assert_eq!(reason, Rejection::HtmlContent);
    let kept_at = kept_at.expect("rejected file kept");
    assert_eq!(kept_at, dir.path().join("rejected").join("report_m4.xlsx"));
    assert!(kept_at.exists());
    assert!(!dir.path().join("report_m4.xlsx").exists());
    assert_eq!(
        hits(&log),
        vec!["/r", "/r/download", "/r?export=true", "/r?format=xlsx"]
    );
}

#[tokio::test]
async fn failed_first_request_is_a_download_error() {
    let (base, _log) = start_server(|_| Routes::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let link = ExtractedLink::new(format!("{base}/missing.xlsx"), "x");

    let err = downloader(dir.path()).fetch(&link, "m5").await.unwrap_err();

    assert!(matches!(err, DownloadError::Request { .. }));
    assert!(!dir.path().join("x_m5.xlsx").exists());
}
