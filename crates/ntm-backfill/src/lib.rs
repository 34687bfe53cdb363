//! Historical backfill: pull per-ticker price and forward-EPS snapshots out of
//! the scouter workbook, join them and fold them into the master workbook.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use ntm_core::{
    normalize_ticker, serial_to_date, CellValue, Country, EpsRecord, MergedRecord, PriceRecord,
    SheetGrid, Table, MASTER_COLUMNS,
};
use ntm_storage::{StorageError, WorkbookStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ntm-backfill";

/// Header serials at or below this are not treated as snapshot dates (~2009-07-06).
pub const DEFAULT_MIN_SERIAL: i64 = 40000;

/// Cell texts that mean "no value".
const NOT_AVAILABLE: [&str; 4] = ["-", "#N/A", "N/A", "#VALUE!"];

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub workspace_root: PathBuf,
    pub history_workbook: PathBuf,
    pub master_workbook: PathBuf,
    pub column_mapping: Option<PathBuf>,
}

impl BackfillConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("NTM_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            history_workbook: std::env::var("NTM_HISTORY_WORKBOOK")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("College_Global_Scouter_20230811.xlsb")),
            master_workbook: std::env::var("NTM_MASTER_WORKBOOK")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("Global_NTM_Master_DB.xlsx")),
            column_mapping: std::env::var("NTM_COLUMN_MAPPING").ok().map(PathBuf::from),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn history_path(&self) -> PathBuf {
        self.resolve(&self.history_workbook)
    }

    pub fn master_path(&self) -> PathBuf {
        self.resolve(&self.master_workbook)
    }

    /// The mapping file if one is configured, otherwise the built-in layouts.
    pub fn load_plan(&self) -> Result<BackfillPlan> {
        let Some(mapping) = &self.column_mapping else {
            return Ok(BackfillPlan::default());
        };
        let path = self.resolve(mapping);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Extra header row that must mention one of `needles` above/below a date column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRule {
    pub row: usize,
    pub needles: Vec<String>,
}

/// Where a sheet keeps its headers and data, for the heuristic locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SheetLayout {
    pub date_row: usize,
    pub ticker_row: usize,
    pub data_start_row: usize,
    pub ticker_labels: Vec<String>,
    pub fallback_ticker_column: Option<usize>,
    pub marker_rules: Vec<MarkerRule>,
    pub min_serial: i64,
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self {
            date_row: 0,
            ticker_row: 1,
            data_start_row: 2,
            ticker_labels: vec!["Ticker".to_string()],
            fallback_ticker_column: None,
            marker_rules: Vec::new(),
            min_serial: DEFAULT_MIN_SERIAL,
        }
    }
}

impl SheetLayout {
    /// `3. NUM`: serials and the `Ticker` label share row 2.
    pub fn price_sheet() -> Self {
        Self {
            date_row: 2,
            ticker_row: 2,
            data_start_row: 3,
            ..Self::default()
        }
    }

    /// `2. EPS`: serials on row 0, EPS markers on rows 1-2, ticker label on row 2.
    pub fn eps_sheet() -> Self {
        Self {
            date_row: 0,
            ticker_row: 2,
            data_start_row: 3,
            ticker_labels: vec!["종목코드".to_string(), "Ticker".to_string()],
            fallback_ticker_column: Some(1),
            marker_rules: vec![
                MarkerRule {
                    row: 1,
                    needles: vec!["EPS".to_string(), "Fwd".to_string()],
                },
                MarkerRule {
                    row: 2,
                    needles: vec!["EPS".to_string()],
                },
            ],
            min_serial: DEFAULT_MIN_SERIAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateColumn {
    pub column: usize,
    pub date: NaiveDate,
}

/// Resolved column roles of one sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub ticker_column: usize,
    pub date_columns: Vec<DateColumn>,
}

/// One input sheet: its name, its layout, and optionally a frozen column map
/// that replaces header sniffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSpec {
    pub sheet: String,
    #[serde(default)]
    pub layout: SheetLayout,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<ColumnMap>,
}

impl SheetSpec {
    pub fn resolve_columns(&self, grid: &SheetGrid) -> Result<ColumnMap, LocateError> {
        match &self.columns {
            Some(columns) => Ok(columns.clone()),
            None => locate_columns(grid, &self.layout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillPlan {
    pub price: SheetSpec,
    pub eps: SheetSpec,
}

impl Default for BackfillPlan {
    fn default() -> Self {
        Self {
            price: SheetSpec {
                sheet: "3. NUM".to_string(),
                layout: SheetLayout::price_sheet(),
                columns: None,
            },
            eps: SheetSpec {
                sheet: "2. EPS".to_string(),
                layout: SheetLayout::eps_sheet(),
                columns: None,
            },
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocateError {
    #[error("no ticker column labelled {labels:?} on row {row} of sheet '{sheet}'")]
    TickerColumnNotFound {
        sheet: String,
        row: usize,
        labels: Vec<String>,
    },
}

/// Serial carried by a header cell: whole digits (an optional `.fraction`
/// suffix is ignored), a number, or a date-formatted cell.
pub fn header_serial(cell: &CellValue) -> Option<i64> {
    match cell {
        CellValue::Number(n) | CellValue::DateTime(n) if n.is_finite() && *n >= 0.0 => {
            Some(n.trunc() as i64)
        }
        CellValue::Text(text) => {
            let digits = text.split('.').next().unwrap_or_default();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Finds the ticker column and the snapshot-date columns from header rows.
pub fn locate_columns(grid: &SheetGrid, layout: &SheetLayout) -> Result<ColumnMap, LocateError> {
    let ticker_column = grid
        .row(layout.ticker_row)
        .iter()
        .position(|cell| {
            let text = cell.render();
            layout.ticker_labels.iter().any(|label| *label == text)
        })
        .or(layout.fallback_ticker_column)
        .ok_or_else(|| LocateError::TickerColumnNotFound {
            sheet: grid.name.clone(),
            row: layout.ticker_row,
            labels: layout.ticker_labels.clone(),
        })?;

    let date_columns = grid
        .row(layout.date_row)
        .iter()
        .enumerate()
        .filter_map(|(column, cell)| {
            let serial = header_serial(cell).filter(|s| *s > layout.min_serial)?;
            if !layout.marker_rules.is_empty() && !has_marker(grid, column, &layout.marker_rules) {
                return None;
            }
            let date = serial_to_date(serial)?;
            Some(DateColumn { column, date })
        })
        .collect();

    Ok(ColumnMap {
        ticker_column,
        date_columns,
    })
}

fn has_marker(grid: &SheetGrid, column: usize, rules: &[MarkerRule]) -> bool {
    rules.iter().any(|rule| {
        let text = grid.cell(rule.row, column).map(CellValue::render).unwrap_or_default();
        rule.needles.iter().any(|needle| text.contains(needle.as_str()))
    })
}

/// One non-blank numeric cell under a snapshot-date column.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedValue {
    pub date: NaiveDate,
    pub ticker: String,
    pub value: f64,
}

/// Numeric content of a data cell; blanks, not-available markers, errors and
/// unparseable text yield `None`.
pub fn parse_numeric_cell(cell: &CellValue) -> Option<f64> {
    match cell {
        CellValue::Number(n) => Some(*n).filter(|n| n.is_finite()),
        CellValue::Text(text) => {
            let text = text.trim();
            if text.is_empty() || NOT_AVAILABLE.contains(&text) {
                return None;
            }
            text.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        _ => None,
    }
}

/// Walks data rows and yields one value per (row, date column) that parses,
/// with identical (date, ticker, value) tuples collapsed.
pub fn extract_values(grid: &SheetGrid, columns: &ColumnMap, data_start_row: usize) -> Vec<ExtractedValue> {
    let mut seen = HashSet::new();
    let mut values = Vec::new();

    for row in grid.rows.iter().skip(data_start_row) {
        let ticker = match row.get(columns.ticker_column) {
            Some(cell @ (CellValue::Text(_) | CellValue::Number(_))) => cell.render().trim().to_string(),
            _ => continue,
        };
        if ticker.is_empty() {
            continue;
        }
        for date_column in &columns.date_columns {
            let Some(value) = row.get(date_column.column).and_then(parse_numeric_cell) else {
                continue;
            };
            if seen.insert((date_column.date, ticker.clone(), value.to_bits())) {
                values.push(ExtractedValue {
                    date: date_column.date,
                    ticker: ticker.clone(),
                    value,
                });
            }
        }
    }
    values
}

pub fn price_records(values: Vec<ExtractedValue>) -> Vec<PriceRecord> {
    values
        .into_iter()
        .map(|v| PriceRecord {
            date: v.date,
            ticker: v.ticker,
            price: v.value,
        })
        .collect()
}

pub fn eps_records(values: Vec<ExtractedValue>) -> Vec<EpsRecord> {
    values
        .into_iter()
        .map(|v| EpsRecord {
            date: v.date,
            ticker: v.ticker,
            ntm_eps: v.value,
        })
        .collect()
}

/// Full outer join on (date, normalized ticker). Keys with several values on
/// one side produce every pairing; a side with no values contributes `None`.
pub fn merge_records(prices: &[PriceRecord], eps: &[EpsRecord]) -> Vec<MergedRecord> {
    let mut joined: BTreeMap<(NaiveDate, String), (Vec<f64>, Vec<f64>)> = BTreeMap::new();
    for p in prices {
        joined
            .entry((p.date, normalize_ticker(&p.ticker)))
            .or_default()
            .0
            .push(p.price);
    }
    for e in eps {
        joined
            .entry((e.date, normalize_ticker(&e.ticker)))
            .or_default()
            .1
            .push(e.ntm_eps);
    }

    let mut merged = Vec::new();
    for ((date, ticker), (price_values, eps_values)) in joined {
        if ticker.is_empty() {
            continue;
        }
        let price_side = optional_side(&price_values);
        let eps_side = optional_side(&eps_values);
        for price in &price_side {
            for ntm_eps in &eps_side {
                merged.push(MergedRecord::backfill(date, ticker.clone(), *price, *ntm_eps));
            }
        }
    }
    merged
}

fn optional_side(values: &[f64]) -> Vec<Option<f64>> {
    if values.is_empty() {
        vec![None]
    } else {
        values.iter().copied().map(Some).collect()
    }
}

/// Puts `new_rows` ahead of `existing`, keeps the last row per (Date, Ticker)
/// so existing master rows win, then orders by Ticker and Date. Columns the
/// master carries beyond the standard schema are kept after it.
pub fn merge_into_master(new_rows: &[MergedRecord], existing: &Table) -> Table {
    let existing_names = unique_headers(&existing.columns);
    let mut columns: Vec<String> = MASTER_COLUMNS.iter().map(|c| c.to_string()).collect();
    let mut positions: Vec<Option<usize>> = columns
        .iter()
        .map(|c| existing_names.iter().position(|name| name == c))
        .collect();
    for (i, name) in existing_names.iter().enumerate() {
        if !columns.contains(name) {
            columns.push(name.clone());
            positions.push(Some(i));
        }
    }
    let width = columns.len();

    let mut rows: Vec<Vec<CellValue>> = Vec::with_capacity(new_rows.len() + existing.len());
    for record in new_rows {
        let mut cells = record.to_cells();
        cells.resize(width, CellValue::Empty);
        rows.push(cells);
    }
    for row in &existing.rows {
        let mut cells: Vec<CellValue> = positions
            .iter()
            .map(|p| p.and_then(|i| row.get(i).cloned()).unwrap_or_default())
            .collect();
        if matches!(cells[0], CellValue::DateTime(_)) {
            cells[0] = CellValue::Text(cells[0].render());
        }
        rows.push(cells);
    }

    let keys: Vec<(String, String)> = rows
        .iter()
        .map(|r| (r[0].render(), r[1].render()))
        .collect();
    let mut last_index: HashMap<&(String, String), usize> = HashMap::new();
    for (i, key) in keys.iter().enumerate() {
        last_index.insert(key, i);
    }
    let mut kept: Vec<Vec<CellValue>> = rows
        .into_iter()
        .enumerate()
        .filter(|(i, _)| last_index.get(&keys[*i]) == Some(i))
        .map(|(_, row)| row)
        .collect();

    kept.sort_by_cached_key(|row| (row[1].render(), row[0].render()));
    Table {
        columns,
        rows: kept,
    }
}

/// Names blank headers `Unnamed: {index}` and suffixes repeats `.1`, `.2`, ...
/// so every existing column keeps its data through the merge.
fn unique_headers(columns: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let base = if column.trim().is_empty() {
            format!("Unnamed: {i}")
        } else {
            column.clone()
        };
        let mut name = base.clone();
        let mut suffix = 0;
        while names.contains(&name) {
            suffix += 1;
            name = format!("{base}.{suffix}");
        }
        names.push(name);
    }
    names
}

#[derive(Debug, Clone, Serialize)]
pub struct CountrySummary {
    pub country: Country,
    pub added: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub price_snapshots: usize,
    pub eps_snapshots: usize,
    pub price_records: usize,
    pub eps_records: usize,
    pub merged_records: usize,
    pub countries: Vec<CountrySummary>,
}

impl BackfillSummary {
    pub fn added(&self, country: Country) -> usize {
        self.countries
            .iter()
            .find(|c| c.country == country)
            .map(|c| c.added)
            .unwrap_or(0)
    }
}

pub struct BackfillPipeline {
    config: BackfillConfig,
    plan: BackfillPlan,
}

impl BackfillPipeline {
    pub fn new(config: BackfillConfig, plan: BackfillPlan) -> Self {
        Self { config, plan }
    }

    fn load_inputs(&self) -> Result<(SheetGrid, SheetGrid)> {
        let history = WorkbookStore::new(self.config.history_path());
        info!(path = %history.path().display(), "loading historical workbook");
        let price_grid = history.read_sheet(&self.plan.price.sheet)?;
        let eps_grid = history.read_sheet(&self.plan.eps.sheet)?;
        Ok((price_grid, eps_grid))
    }

    /// The plan with every sheet's column map resolved against the workbook.
    pub fn detect_columns(&self) -> Result<BackfillPlan> {
        let (price_grid, eps_grid) = self.load_inputs()?;
        let mut plan = self.plan.clone();
        plan.price.columns = Some(plan.price.resolve_columns(&price_grid)?);
        plan.eps.columns = Some(plan.eps.resolve_columns(&eps_grid)?);
        Ok(plan)
    }

    pub fn run_once(&self) -> Result<BackfillSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let (price_grid, eps_grid) = self.load_inputs()?;
        let price_columns = self.plan.price.resolve_columns(&price_grid)?;
        let eps_columns = self.plan.eps.resolve_columns(&eps_grid)?;
        info!(snapshots = price_columns.date_columns.len(), "located price snapshot columns");
        info!(snapshots = eps_columns.date_columns.len(), "located EPS snapshot columns");

        let prices = price_records(extract_values(
            &price_grid,
            &price_columns,
            self.plan.price.layout.data_start_row,
        ));
        let eps = eps_records(extract_values(
            &eps_grid,
            &eps_columns,
            self.plan.eps.layout.data_start_row,
        ));
        let merged = merge_records(&prices, &eps);
        info!(
            prices = prices.len(),
            eps = eps.len(),
            merged = merged.len(),
            "merged historical records"
        );

        let master = WorkbookStore::new(self.config.master_path());
        if !master.exists() {
            bail!("master workbook {} does not exist", master.path().display());
        }

        let mut replacements = Vec::with_capacity(Country::ALL.len());
        let mut countries = Vec::with_capacity(Country::ALL.len());
        for country in Country::ALL {
            let new_rows: Vec<MergedRecord> = merged
                .iter()
                .filter(|r| r.country == country)
                .cloned()
                .collect();
            let existing = match master.read_sheet(country.sheet_name()) {
                Ok(grid) => Table::from_grid(&grid),
                Err(StorageError::SheetNotFound { sheet, .. }) => {
                    warn!(%sheet, "master sheet missing; it will be created");
                    Table::with_columns(MASTER_COLUMNS)
                }
                Err(err) => return Err(err.into()),
            };
            let updated = merge_into_master(&new_rows, &existing);
            countries.push(CountrySummary {
                country,
                added: new_rows.len(),
                total: updated.len(),
            });
            replacements.push(updated.to_grid(country.sheet_name()));
        }

        master
            .replace_sheets(&replacements)
            .with_context(|| format!("writing {}", master.path().display()))?;

        let summary = BackfillSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            price_snapshots: price_columns.date_columns.len(),
            eps_snapshots: eps_columns.date_columns.len(),
            price_records: prices.len(),
            eps_records: eps.len(),
            merged_records: merged.len(),
            countries,
        };
        info!(
            %run_id,
            usa = summary.added(Country::Usa),
            kor = summary.added(Country::Kor),
            "backfill complete"
        );
        Ok(summary)
    }
}

pub fn run_backfill_from_env() -> Result<BackfillSummary> {
    let config = BackfillConfig::from_env();
    let plan = config.load_plan()?;
    BackfillPipeline::new(config, plan).run_once()
}

pub fn detect_columns_from_env() -> Result<BackfillPlan> {
    let config = BackfillConfig::from_env();
    let plan = config.load_plan()?;
    BackfillPipeline::new(config, plan).detect_columns()
}
