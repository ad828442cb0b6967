use std::path::{Path, PathBuf};

use mmrl_adapters::{normalize_file, read_sheet, NormalizerConfig};
use mmrl_core::{Table, CANONICAL_COLUMNS};
use rust_xlsxwriter::Workbook;

fn write_vendor_export(path: &Path) {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Mass messages").unwrap();

    let headers = [
        "Sender",
        "Sending Time",
        "Price",
        "Sent",
        "Viewed",
        "Purchased",
        "Earnings",
        "Message Text",
        "Campaign ID",
    ];
    // Vendor exports start with a blank banner row.
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string(1, col as u16, *header).unwrap();
    }

    sheet.write_string(2, 0, "Creator A").unwrap();
    sheet.write_string(2, 1, "2024-01-01 10:00:00 SD Chu").unwrap();
    sheet.write_string(2, 2, "$9.99").unwrap();
    sheet.write_number(2, 3, 1500.0).unwrap();
    sheet.write_number(2, 4, 320.0).unwrap();
    sheet.write_number(2, 5, 12.0).unwrap();
    sheet.write_string(2, 6, "$119.88").unwrap();
    sheet.write_string(2, 7, "New set is up").unwrap();
    sheet.write_number(2, 8, 77.0).unwrap();

    sheet.write_string(4, 0, "Creator B").unwrap();
    sheet.write_string(4, 1, "2024-01-02 08:30:00").unwrap();
    sheet.write_string(4, 2, "Free").unwrap();
    sheet.write_number(4, 3, 900.0).unwrap();
    sheet.write_string(4, 4, "n/a").unwrap();
    sheet.write_number(4, 5, 0.0).unwrap();
    sheet.write_number(4, 6, 0.0).unwrap();
    sheet.write_string(4, 7, "nan").unwrap();

    workbook.save(path).unwrap();
}

fn write_canonical(path: &Path, table: &Table) {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, name) in CANONICAL_COLUMNS.iter().enumerate() {
        sheet.write_string(0, col as u16, *name).unwrap();
    }
    for (idx, row) in table.rows.iter().enumerate() {
        let r = idx as u32 + 1;
        sheet.write_string(r, 0, &row.message_id).unwrap();
        sheet.write_string(r, 1, &row.sender).unwrap();
        sheet.write_string(r, 2, &row.sending_time).unwrap();
        sheet.write_string(r, 3, &row.price).unwrap();
        sheet.write_number(r, 4, row.sent as f64).unwrap();
        sheet.write_number(r, 5, row.viewed as f64).unwrap();
        sheet.write_number(r, 6, row.purchased as f64).unwrap();
        sheet.write_number(r, 7, row.earnings).unwrap();
        sheet.write_string(r, 8, &row.message).unwrap();
    }
    workbook.save(path).unwrap();
}

fn scratch(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[test]
fn vendor_export_is_reconciled_to_canonical_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch(&dir, "report_m1.xlsx");
    write_vendor_export(&path);

    let table = normalize_file(&path, "m1", &NormalizerConfig::default()).unwrap();

    assert_eq!(table.len(), 2);
    assert_eq!(table.dropped_columns, vec!["campaign_id".to_string()]);

    let first = &table.rows[0];
    assert_eq!(first.message_id, "m1");
    assert_eq!(first.sender, "Creator A");
    assert_eq!(first.sending_time, "2024-01-01 10:00:00");
    assert_eq!(first.price, "$9.99");
    assert_eq!((first.sent, first.viewed, first.purchased), (1500, 320, 12));
    assert_eq!(first.earnings, 119.88);
    assert_eq!(first.message, "New set is up");

    let second = &table.rows[1];
    assert_eq!(second.viewed, 0);
    assert_eq!(second.message, "");
    assert_eq!(second.composite_key().as_str(), "m1|2024-01-02 08:30:00");
}

#[test]
fn normalized_table_round_trips_with_the_canonical_column_set() {
    let dir = tempfile::tempdir().unwrap();
    let source = scratch(&dir, "source.xlsx");
    write_vendor_export(&source);
    let table = normalize_file(&source, "m1", &NormalizerConfig::default()).unwrap();

    let canonical = scratch(&dir, "canonical.xlsx");
    write_canonical(&canonical, &table);

    let sheet = read_sheet(&canonical, None).unwrap();
    assert_eq!(sheet.headers, CANONICAL_COLUMNS.map(str::to_string).to_vec());

    let again = normalize_file(&canonical, "m1", &NormalizerConfig::default()).unwrap();
    assert!(again.dropped_columns.is_empty());
    assert_eq!(again.rows, table.rows);
}

#[test]
fn named_sheet_is_selected_and_missing_sheet_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch(&dir, "named.xlsx");
    write_vendor_export(&path);

    let config = NormalizerConfig {
        sheet: Some("Mass messages".to_string()),
        ..NormalizerConfig::default()
    };
    assert_eq!(normalize_file(&path, "m1", &config).unwrap().len(), 2);

    let missing = NormalizerConfig {
        sheet: Some("Summary".to_string()),
        ..NormalizerConfig::default()
    };
    assert!(normalize_file(&path, "m1", &missing).is_err());
}

#[test]
fn header_only_sheet_yields_an_empty_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch(&dir, "empty.xlsx");
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, "Sender").unwrap();
    sheet.write_string(0, 1, "Sending Time").unwrap();
    workbook.save(&path).unwrap();

    let table = normalize_file(&path, "m1", &NormalizerConfig::default()).unwrap();
    assert!(table.is_empty());
}

#[test]
fn misnamed_workbook_is_read_by_the_next_engine_in_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch(&dir, "report_m1.xls");
    write_vendor_export(&path);

    let sheet = read_sheet(&path, None).unwrap();
    assert_eq!(sheet.name, "Mass messages");
    assert_eq!(normalize_file(&path, "m1", &NormalizerConfig::default()).unwrap().len(), 2);
}

#[test]
fn unreadable_file_reports_every_engine_tried() {
    let dir = tempfile::tempdir().unwrap();
    let path = scratch(&dir, "broken.xlsx");
    std::fs::write(&path, b"definitely not a workbook").unwrap();

    let err = read_sheet(&path, None).unwrap_err().to_string();
    for engine in ["Xlsx", "Xls", "Auto"] {
        assert!(err.contains(&format!("{engine}:")), "{err}");
    }
}
