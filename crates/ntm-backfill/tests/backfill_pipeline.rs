use std::path::Path;

use ntm_backfill::{BackfillConfig, BackfillPipeline, BackfillPlan};
use ntm_core::{CellValue, SheetGrid, Table, MASTER_COLUMNS};
use ntm_storage::WorkbookStore;

fn t(s: &str) -> CellValue {
    CellValue::text(s)
}

fn n(v: f64) -> CellValue {
    CellValue::Number(v)
}

fn config(root: &Path) -> BackfillConfig {
    BackfillConfig {
        workspace_root: root.to_path_buf(),
        history_workbook: "scouter.xlsx".into(),
        master_workbook: "master.xlsx".into(),
        column_mapping: None,
    }
}

fn write_history(root: &Path, price_header: &str) {
    let price = SheetGrid::new(
        "3. NUM",
        vec![
            vec![t("Scouter")],
            vec![],
            vec![t("Name"), t(price_header), n(44927.0), n(44958.0)],
            vec![t("Apple"), t("AAPL-US"), n(150.0), n(160.0)],
            vec![t("Samsung"), t("005930.KS"), n(70000.0), t("-")],
        ],
    );
    let eps = SheetGrid::new(
        "2. EPS",
        vec![
            vec![t("Name"), t("Code"), n(44927.0), n(44958.0)],
            vec![CellValue::Empty, CellValue::Empty, t("EPS Fwd"), t("EPS Fwd")],
            vec![],
            vec![t("Apple"), t("AAPL-US"), n(5.0), n(0.0)],
            vec![t("Samsung"), t("005930.KS"), n(3500.0), n(3600.0)],
        ],
    );
    WorkbookStore::new(root.join("scouter.xlsx"))
        .write_all(&[price, eps])
        .expect("write history");
}

fn write_master(root: &Path) {
    let header: Vec<CellValue> = MASTER_COLUMNS.iter().map(|c| t(c)).collect();
    let mut curated: Vec<CellValue> = vec![CellValue::Empty; MASTER_COLUMNS.len()];
    curated[0] = t("2023-01-01");
    curated[1] = t("AAPL");
    curated[2] = t("Apple Inc.");
    curated[4] = n(151.0);
    curated[10] = t("Live");
    curated[11] = t("USA");
    let usa = SheetGrid::new("USA_Stocks", vec![header, curated]);
    let notes = SheetGrid::new("Notes", vec![vec![t("keep me")]]);
    WorkbookStore::new(root.join("master.xlsx"))
        .write_all(&[notes, usa])
        .expect("write master");
}

fn read_table(root: &Path, sheet: &str) -> Table {
    let grid = WorkbookStore::new(root.join("master.xlsx"))
        .read_sheet(sheet)
        .expect("read master sheet");
    Table::from_grid(&grid)
}

#[test]
fn backfill_merges_history_into_master_sheets() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_history(dir.path(), "Ticker");
    write_master(dir.path());

    let pipeline = BackfillPipeline::new(config(dir.path()), BackfillPlan::default());
    let summary = pipeline.run_once().expect("backfill");
    assert_eq!(summary.price_snapshots, 2);
    assert_eq!(summary.eps_snapshots, 2);
    assert_eq!(summary.merged_records, 4);

    let usa = read_table(dir.path(), "USA_Stocks");
    assert_eq!(usa.len(), 2);
    assert_eq!(usa.rows[0][0], t("2023-01-01"));
    assert_eq!(usa.rows[0][2], t("Apple Inc."));
    assert_eq!(usa.rows[0][10], t("Live"));
    assert_eq!(usa.rows[1][0], t("2023-02-01"));
    assert_eq!(usa.rows[1][4], n(160.0));
    assert_eq!(usa.rows[1][8], n(0.0));
    assert_eq!(usa.rows[1][10], t("Historical Backfill"));

    let kor = read_table(dir.path(), "KOR_Stocks");
    assert_eq!(kor.len(), 2);
    assert_eq!(kor.rows[0][1], t("005930.KS"));
    assert_eq!(kor.rows[0][8], n(20.0));
    assert_eq!(kor.rows[1][4], CellValue::Empty);
    assert_eq!(kor.rows[1][11], t("KOR"));

    let sheets = WorkbookStore::new(dir.path().join("master.xlsx"))
        .sheet_names()
        .expect("sheet names");
    assert_eq!(sheets, vec!["Notes", "USA_Stocks", "KOR_Stocks"]);

    pipeline.run_once().expect("second backfill");
    assert_eq!(read_table(dir.path(), "USA_Stocks"), usa);
    assert_eq!(read_table(dir.path(), "KOR_Stocks"), kor);
}

#[test]
fn missing_ticker_column_leaves_master_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_history(dir.path(), "Symbol");
    write_master(dir.path());
    let before = std::fs::read(dir.path().join("master.xlsx")).expect("read master");

    let err = BackfillPipeline::new(config(dir.path()), BackfillPlan::default())
        .run_once()
        .expect_err("ticker column is required");
    assert!(err.to_string().contains("no ticker column"));

    let after = std::fs::read(dir.path().join("master.xlsx")).expect("read master");
    assert_eq!(before, after);
}

#[test]
fn detected_columns_can_be_frozen_into_a_mapping() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_history(dir.path(), "Ticker");

    let plan = BackfillPipeline::new(config(dir.path()), BackfillPlan::default())
        .detect_columns()
        .expect("detect");
    let price = plan.price.columns.as_ref().expect("price columns");
    assert_eq!(price.ticker_column, 1);
    assert_eq!(price.date_columns.len(), 2);

    let yaml = serde_yaml::to_string(&plan).expect("yaml");
    let reparsed: BackfillPlan = serde_yaml::from_str(&yaml).expect("reparse");
    assert_eq!(reparsed, plan);
}
