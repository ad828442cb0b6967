//! Spreadsheet parsing and reconciliation into the canonical row schema.

use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use calamine::{open_workbook, open_workbook_auto, Data, DataType, Range, Reader, Xls, Xlsx};
use mmrl_core::{NormalizedRow, Table, CANONICAL_COLUMNS};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const PLACEHOLDERS: [&str; 6] = ["nan", "NaN", "None", "NaT", "null", "<NA>"];
const FUZZY_MIN_LEN: usize = 4;

const ALIASES: [(&str, &[&str]); 8] = [
    ("sender", &["sender_name", "sent_by", "from", "creator"]),
    (
        "sending_time",
        &["send_time", "sent_at", "sending_date", "date", "time", "datetime", "timestamp"],
    ),
    ("price", &["cost", "ppv_price"]),
    ("sent", &["sent_count", "recipients", "total_sent"]),
    ("viewed", &["views", "view_count", "opened"]),
    ("purchased", &["purchases", "bought", "unlocks"]),
    ("earnings", &["revenue", "net_earnings", "income"]),
    ("message", &["message_text", "text", "content", "body", "caption"]),
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no spreadsheet reader could open {path}: {attempts}")]
    Unreadable { path: PathBuf, attempts: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    DateTime(String),
}

impl Cell {
    fn from_data(data: &Data) -> Self {
        match data {
            Data::Int(value) => Cell::Number(*value as f64),
            Data::Float(value) => Cell::Number(*value),
            Data::String(value) => Cell::Text(value.clone()),
            Data::Bool(value) => Cell::Bool(*value),
            Data::DateTime(_) => data
                .as_datetime()
                .map(|dt| Cell::DateTime(dt.format(DATE_FORMAT).to_string()))
                .unwrap_or(Cell::Empty),
            Data::DateTimeIso(value) => Cell::DateTime(value.replacen('T', " ", 1)),
            Data::DurationIso(value) => Cell::Text(value.clone()),
            Data::Error(_) | Data::Empty => Cell::Empty,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(value) | Cell::DateTime(value) => value.trim().to_string(),
            Cell::Number(value) => format_number(*value),
            Cell::Bool(value) => value.to_string(),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(value) => value.trim().is_empty(),
            _ => false,
        }
    }
}

/// First sheet (or a named one) as raw cells. `headers` comes from the first non-empty row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSheet {
    pub name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub sheet: Option<String>,
    /// Vendor annotations appended to timestamps, removed before loading.
    pub vendor_time_suffixes: Vec<String>,
    pub fuzzy_threshold: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            sheet: None,
            vendor_time_suffixes: vec!["SD Chu".to_string()],
            fuzzy_threshold: 0.94,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Engine {
    Xlsx,
    Xls,
    Auto,
}

fn engine_chain(path: &Path) -> &'static [Engine] {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("xlsx") => &[Engine::Xlsx, Engine::Xls, Engine::Auto],
        Some("xls") => &[Engine::Xls, Engine::Xlsx, Engine::Auto],
        _ => &[Engine::Auto],
    }
}

fn pick_range<RS, R>(workbook: &mut R, sheet: Option<&str>) -> Result<(String, Range<Data>), String>
where
    RS: Read + Seek,
    R: Reader<RS>,
    R::Error: std::fmt::Display,
{
    let names = workbook.sheet_names();
    let name = match sheet {
        Some(wanted) => names
            .iter()
            .find(|name| name.as_str() == wanted)
            .cloned()
            .ok_or_else(|| format!("sheet {wanted:?} not found"))?,
        None => names
            .first()
            .cloned()
            .ok_or_else(|| "workbook has no sheets".to_string())?,
    };
    let range = workbook
        .worksheet_range(&name)
        .map_err(|err| err.to_string())?;
    Ok((name, range))
}

fn open_with(engine: Engine, path: &Path, sheet: Option<&str>) -> Result<(String, Range<Data>), String> {
    match engine {
        Engine::Xlsx => {
            let mut workbook = open_workbook::<Xlsx<_>, _>(path).map_err(|err| err.to_string())?;
            pick_range(&mut workbook, sheet)
        }
        Engine::Xls => {
            let mut workbook = open_workbook::<Xls<_>, _>(path).map_err(|err| err.to_string())?;
            pick_range(&mut workbook, sheet)
        }
        Engine::Auto => {
            let mut workbook = open_workbook_auto(path).map_err(|err| err.to_string())?;
            pick_range(&mut workbook, sheet)
        }
    }
}

pub fn read_sheet(path: &Path, sheet: Option<&str>) -> Result<RawSheet, ParseError> {
    let mut attempts = Vec::new();
    for engine in engine_chain(path) {
        match open_with(*engine, path, sheet) {
            Ok((name, range)) => {
                debug!(?engine, sheet = %name, "opened workbook");
                let mut rows = range
                    .rows()
                    .map(|row| row.iter().map(Cell::from_data).collect::<Vec<_>>())
                    .skip_while(|row| row.iter().all(Cell::is_blank));
                let headers = rows
                    .next()
                    .map(|row| row.iter().map(Cell::render).collect())
                    .unwrap_or_default();
                return Ok(RawSheet {
                    name,
                    headers,
                    rows: rows.collect(),
                });
            }
            Err(err) => attempts.push(format!("{engine:?}: {err}")),
        }
    }
    Err(ParseError::Unreadable {
        path: path.to_path_buf(),
        attempts: attempts.join("; "),
    })
}

/// Lowercase, collapse non-alphanumeric runs into one `_`, strip edge underscores.
pub fn normalize_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.trim().chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out
}

fn alias_target(header: &str) -> Option<&'static str> {
    ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&header))
        .map(|(canonical, _)| *canonical)
}

/// Canonical target for each source column, `None` when the column is dropped.
fn map_columns(headers: &[String], threshold: f64) -> Vec<Option<&'static str>> {
    let mut mapping: Vec<Option<&'static str>> = vec![None; headers.len()];
    let mut used: Vec<&'static str> = Vec::new();

    for (idx, header) in headers.iter().enumerate() {
        if let Some(target) = CANONICAL_COLUMNS.iter().copied().find(|c| *c == header.as_str()) {
            if !used.contains(&target) {
                mapping[idx] = Some(target);
                used.push(target);
            }
        }
    }

    for (idx, header) in headers.iter().enumerate() {
        if mapping[idx].is_some() {
            continue;
        }
        if let Some(target) = alias_target(header) {
            if !used.contains(&target) {
                mapping[idx] = Some(target);
                used.push(target);
            }
        }
    }

    for (idx, header) in headers.iter().enumerate() {
        if mapping[idx].is_some() || header.chars().count() < FUZZY_MIN_LEN {
            continue;
        }
        let best = CANONICAL_COLUMNS
            .iter()
            .copied()
            .filter(|c| !used.contains(c))
            .map(|c| (c, jaro_winkler(header, c)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((target, score)) = best {
            debug!(header = %header, target, score, "fuzzy header match");
            mapping[idx] = Some(target);
            used.push(target);
        }
    }
    mapping
}

fn clean_text(cell: &Cell) -> String {
    let text = cell.render();
    if PLACEHOLDERS.contains(&text.as_str()) {
        String::new()
    } else {
        text
    }
}

fn clean_time(cell: &Cell, suffixes: &[String]) -> String {
    let mut text = clean_text(cell);
    for suffix in suffixes.iter().filter(|s| !s.is_empty()) {
        text = text.replace(suffix.as_str(), "");
    }
    text.trim().to_string()
}

fn clean_price(cell: &Cell) -> String {
    clean_text(cell).replace(',', "")
}

fn parse_earnings(cell: &Cell) -> f64 {
    match cell {
        Cell::Number(value) if value.is_finite() => *value,
        _ => {
            let text: String = clean_text(cell)
                .chars()
                .filter(|ch| *ch != ',' && !ch.is_whitespace())
                .collect();
            let text = text.trim_start_matches(['$', '€', '£']);
            text.parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
        }
    }
}

fn parse_count(cell: &Cell) -> u64 {
    let value = match cell {
        Cell::Number(value) => Some(*value),
        _ => clean_text(cell).replace(',', "").parse::<f64>().ok(),
    };
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => v.trunc() as u64,
        _ => 0,
    }
}

pub(crate) fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn cell_at(row: &[Cell], idx: usize) -> Cell {
    row.get(idx).cloned().unwrap_or(Cell::Empty)
}

fn get(row: &[Cell], idx: Option<usize>) -> Cell {
    idx.map(|i| cell_at(row, i)).unwrap_or(Cell::Empty)
}

pub fn normalize_sheet(sheet: &RawSheet, message_id: &str, config: &NormalizerConfig) -> Table {
    let width = sheet
        .rows
        .iter()
        .map(Vec::len)
        .chain(std::iter::once(sheet.headers.len()))
        .max()
        .unwrap_or(0);
    let rows: Vec<&Vec<Cell>> = sheet
        .rows
        .iter()
        .filter(|row| !row.iter().all(Cell::is_blank))
        .collect();
    let kept_columns: Vec<usize> = (0..width)
        .filter(|idx| rows.iter().any(|row| !cell_at(row, *idx).is_blank()))
        .collect();

    let headers: Vec<String> = kept_columns
        .iter()
        .map(|idx| {
            let name = normalize_header(sheet.headers.get(*idx).map(String::as_str).unwrap_or(""));
            if name.is_empty() {
                format!("unnamed_{idx}")
            } else {
                name
            }
        })
        .collect();
    let mapping = map_columns(&headers, config.fuzzy_threshold);

    let dropped_columns: Vec<String> = headers
        .iter()
        .zip(&mapping)
        .filter(|(_, target)| target.is_none())
        .map(|(header, _)| header.clone())
        .collect();
    if !dropped_columns.is_empty() {
        info!(message_id, dropped = ?dropped_columns, "dropping columns outside the canonical schema");
    }

    let source_of = |canonical: &str| {
        mapping
            .iter()
            .position(|target| *target == Some(canonical))
            .map(|pos| kept_columns[pos])
    };
    let (sender, time, price, sent, viewed, purchased, earnings, message) = (
        source_of("sender"),
        source_of("sending_time"),
        source_of("price"),
        source_of("sent"),
        source_of("viewed"),
        source_of("purchased"),
        source_of("earnings"),
        source_of("message"),
    );

    let rows = rows
        .iter()
        .map(|row| NormalizedRow {
            message_id: message_id.to_string(),
            sender: clean_text(&get(row, sender)),
            sending_time: clean_time(&get(row, time), &config.vendor_time_suffixes),
            price: clean_price(&get(row, price)),
            sent: parse_count(&get(row, sent)),
            viewed: parse_count(&get(row, viewed)),
            purchased: parse_count(&get(row, purchased)),
            earnings: parse_earnings(&get(row, earnings)),
            message: clean_text(&get(row, message)),
        })
        .collect();

    Table {
        message_id: message_id.to_string(),
        rows,
        dropped_columns,
    }
}

pub fn normalize_file(path: &Path, message_id: &str, config: &NormalizerConfig) -> Result<Table, ParseError> {
    let sheet = read_sheet(path, config.sheet.as_deref())?;
    let table = normalize_sheet(&sheet, message_id, config);
    info!(message_id, sheet = %sheet.name, rows = table.len(), "normalized report");
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> Cell {
        Cell::Text(value.to_string())
    }

    fn sheet(headers: &[&str], rows: Vec<Vec<Cell>>) -> RawSheet {
        RawSheet {
            name: "Sheet1".to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn headers_are_normalized() {
        assert_eq!(normalize_header("  Sending Time "), "sending_time");
        assert_eq!(normalize_header("Earnings ($)"), "earnings");
        assert_eq!(normalize_header("--Message__Text--"), "message_text");
        assert_eq!(normalize_header("???"), "");
    }

    #[test]
    fn aliases_map_and_missing_columns_are_synthesized() {
        let raw = sheet(
            &["Sender Name", "Date", "Views", "Message Text", "Campaign"],
            vec![vec![
                text("alice"),
                text("2024-01-01 10:00"),
                Cell::Number(12.0),
                text("hi"),
                text("spring"),
            ]],
        );
        let table = normalize_sheet(&raw, "m1", &NormalizerConfig::default());

        assert_eq!(table.dropped_columns, vec!["campaign".to_string()]);
        let row = &table.rows[0];
        assert_eq!(row.message_id, "m1");
        assert_eq!(row.sender, "alice");
        assert_eq!(row.sending_time, "2024-01-01 10:00");
        assert_eq!(row.viewed, 12);
        assert_eq!(row.message, "hi");
        assert_eq!((row.sent, row.purchased, row.earnings), (0, 0, 0.0));
        assert_eq!(row.price, "");
    }

    #[test]
    fn exact_names_win_over_aliases() {
        let raw = sheet(
            &["Date", "Sending Time"],
            vec![vec![text("2024-01-01"), text("2024-01-01 09:00:00")]],
        );
        let table = normalize_sheet(&raw, "m1", &NormalizerConfig::default());
        assert_eq!(table.rows[0].sending_time, "2024-01-01 09:00:00");
        assert_eq!(table.dropped_columns, vec!["date".to_string()]);
    }

    #[test]
    fn values_are_cleaned_and_coerced() {
        let raw = sheet(
            &["Sender", "Sending time", "Price", "Sent", "Viewed", "Purchased", "Earnings", "Message"],
            vec![
                vec![
                    text("nan"),
                    text("2024-01-01 00:00:00 SD Chu"),
                    text("1,250.50"),
                    text("1,200"),
                    text("abc"),
                    Cell::Number(3.7),
                    text("$ 1,234.50"),
                    text(" None "),
                ],
                vec![
                    text("bob"),
                    Cell::DateTime("2024-01-02 00:00:00".to_string()),
                    Cell::Number(5.0),
                    Cell::Number(-4.0),
                    Cell::Number(9.0),
                    Cell::Empty,
                    text("n/a"),
                    text("hello"),
                ],
            ],
        );
        let table = normalize_sheet(&raw, "m9", &NormalizerConfig::default());
        let first = &table.rows[0];
        assert_eq!(first.sender, "");
        assert_eq!(first.sending_time, "2024-01-01 00:00:00");
        assert_eq!(first.price, "1250.50");
        assert_eq!((first.sent, first.viewed, first.purchased), (1200, 0, 3));
        assert_eq!(first.earnings, 1234.5);
        assert_eq!(first.message, "");

        let second = &table.rows[1];
        assert_eq!(second.sending_time, "2024-01-02 00:00:00");
        assert_eq!(second.price, "5");
        assert_eq!((second.sent, second.viewed), (0, 9));
        assert_eq!(second.earnings, 0.0);
    }

    #[test]
    fn blank_rows_and_columns_are_dropped() {
        let raw = sheet(
            &["Sender", "", "Notes", "Sending Time"],
            vec![
                vec![text("a"), Cell::Empty, text(" "), text("t1")],
                vec![Cell::Empty, Cell::Empty, Cell::Empty, Cell::Empty],
                vec![text("b"), Cell::Empty, Cell::Empty, text("t2")],
            ],
        );
        let table = normalize_sheet(&raw, "m1", &NormalizerConfig::default());
        assert_eq!(table.len(), 2);
        assert!(table.dropped_columns.is_empty());
    }

    #[test]
    fn untitled_columns_with_data_are_reported() {
        let raw = sheet(&["Sender", ""], vec![vec![text("a"), text("x")]]);
        let table = normalize_sheet(&raw, "m1", &NormalizerConfig::default());
        assert_eq!(table.dropped_columns, vec!["unnamed_1".to_string()]);
    }

    #[test]
    fn near_miss_headers_match_fuzzily_but_short_ones_do_not() {
        let raw = sheet(
            &["Purchasd", "Sendr", "Msg"],
            vec![vec![Cell::Number(2.0), text("a"), text("b")]],
        );
        let table = normalize_sheet(&raw, "m1", &NormalizerConfig::default());
        assert_eq!(table.rows[0].purchased, 2);
        assert!(table.dropped_columns.contains(&"msg".to_string()));
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(4.99), "4.99");
        assert_eq!(Cell::Bool(true).render(), "true");
    }

    #[test]
    fn unreadable_file_reports_every_engine() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.xlsx");
        std::fs::write(&path, b"PK\x03\x04 definitely not a workbook").unwrap();
        let err = read_sheet(&path, None).unwrap_err();
        let ParseError::Unreadable { attempts, .. } = err;
        assert!(attempts.contains("Xlsx"));
        assert!(attempts.contains("Auto"));
    }
}
