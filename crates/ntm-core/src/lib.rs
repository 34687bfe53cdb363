//! Core domain model for the NTM master dataset: sheet cells, valuation records
//! and the master table schema.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ntm-core";

/// Column order of the `USA_Stocks` / `KOR_Stocks` master tables.
pub const MASTER_COLUMNS: [&str; 12] = [
    "Date",
    "Ticker",
    "Name",
    "Sector",
    "Price",
    "Analyst_Count",
    "Market_Cap",
    "NTM_EPS",
    "NTM_PER",
    "Implied_Net_Income",
    "Status",
    "Country",
];

pub const DATE_COLUMN: &str = "Date";
pub const TICKER_COLUMN: &str = "Ticker";

/// Name/Sector value stamped on backfilled rows.
pub const HISTORICAL_PLACEHOLDER: &str = "Historical";
pub const BACKFILL_STATUS: &str = "Historical Backfill";

const KOREA_SUFFIX: &str = ".KS";
const US_SUFFIX: &str = "-US";

/// Day-count epoch used by spreadsheet serial dates (1899-12-30).
pub fn spreadsheet_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).expect("epoch is a valid calendar date")
}

/// Converts a whole day-count serial into a calendar date.
pub fn serial_to_date(serial: i64) -> Option<NaiveDate> {
    spreadsheet_epoch().checked_add_signed(Duration::try_days(serial)?)
}

/// Converts a fractional serial (days plus time-of-day) into a timestamp.
pub fn serial_to_datetime(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() {
        return None;
    }
    let millis = (serial * 86_400_000.0).round();
    if millis.abs() >= i64::MAX as f64 {
        return None;
    }
    spreadsheet_epoch()
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(Duration::milliseconds(millis as i64))
}

/// A single spreadsheet cell, independent of the file format it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
    /// Date-formatted cell, kept as its serial so it round-trips.
    DateTime(f64),
    /// Formula error such as `#N/A`.
    Error(String),
}

impl CellValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Empty cell or whitespace-only text.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Display form used for key comparison and header matching. Whole numbers
    /// render without a fractional part, date cells render as ISO-8601.
    pub fn render(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => s.clone(),
            Self::Number(n) => render_number(*n),
            Self::Bool(b) => b.to_string(),
            Self::DateTime(serial) => match serial_to_datetime(*serial) {
                Some(ts) if ts.num_seconds_from_midnight() == 0 => ts.format("%Y-%m-%d").to_string(),
                Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
                None => render_number(*serial),
            },
            Self::Error(code) => code.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) | Self::DateTime(n) => Some(*n),
            _ => None,
        }
    }
}

fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<Option<f64>> for CellValue {
    fn from(value: Option<f64>) -> Self {
        value.map(CellValue::Number).unwrap_or(CellValue::Empty)
    }
}

/// Rectangular-ish cell grid of one worksheet addressed from absolute (0, 0).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SheetGrid {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
    /// Formula text (without the leading `=`) by (row, column). The matching
    /// entry in `rows` holds the last computed value.
    pub formulas: BTreeMap<(usize, usize), String>,
}

impl SheetGrid {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<CellValue>>) -> Self {
        Self {
            name: name.into(),
            rows,
            formulas: BTreeMap::new(),
        }
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<&CellValue> {
        self.rows.get(row).and_then(|r| r.get(col))
    }

    pub fn row(&self, row: usize) -> &[CellValue] {
        self.rows.get(row).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn height(&self) -> usize {
        self.rows.len()
    }
}

/// Header-plus-rows view of a sheet whose first row names the columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl Table {
    pub fn with_columns(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Splits the grid into header and body. Trailing empty header cells are
    /// dropped unless a body row has data under them.
    pub fn from_grid(grid: &SheetGrid) -> Self {
        let Some((header, body)) = grid.rows.split_first() else {
            return Self::default();
        };
        let mut columns: Vec<String> = header.iter().map(CellValue::render).collect();
        while columns.last().is_some_and(|c| c.is_empty()) {
            columns.pop();
        }
        let data_width = body
            .iter()
            .filter_map(|row| row.iter().rposition(|cell| !cell.is_blank()))
            .map(|last| last + 1)
            .max()
            .unwrap_or(0);
        if data_width > columns.len() {
            columns.resize(data_width, String::new());
        }
        let rows = body
            .iter()
            .filter(|row| row.iter().any(|cell| !cell.is_blank()))
            .map(|row| {
                (0..columns.len())
                    .map(|i| row.get(i).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    pub fn to_grid(&self, name: impl Into<String>) -> SheetGrid {
        let mut rows = Vec::with_capacity(self.rows.len() + 1);
        rows.push(self.columns.iter().cloned().map(CellValue::Text).collect());
        rows.extend(self.rows.iter().cloned());
        SheetGrid::new(name, rows)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Country {
    #[serde(rename = "USA")]
    Usa,
    #[serde(rename = "KOR")]
    Kor,
}

impl Country {
    pub const ALL: [Country; 2] = [Country::Usa, Country::Kor];

    /// Expects an already-normalized ticker.
    pub fn from_ticker(ticker: &str) -> Self {
        if ticker.ends_with(KOREA_SUFFIX) {
            Self::Kor
        } else {
            Self::Usa
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Usa => "USA",
            Self::Kor => "KOR",
        }
    }

    /// Master workbook sheet holding this country's rows.
    pub fn sheet_name(self) -> &'static str {
        match self {
            Self::Usa => "USA_Stocks",
            Self::Kor => "KOR_Stocks",
        }
    }
}

/// `AAPL-US ` -> `AAPL`.
pub fn normalize_ticker(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_suffix(US_SUFFIX)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

/// Historical close price for one ticker on one snapshot date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub date: NaiveDate,
    pub ticker: String,
    pub price: f64,
}

/// Forward twelve-month EPS estimate for one ticker on one snapshot date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpsRecord {
    pub date: NaiveDate,
    pub ticker: String,
    pub ntm_eps: f64,
}

/// Outer-joined price/EPS row shaped like a master table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MergedRecord {
    pub date: NaiveDate,
    pub ticker: String,
    pub name: String,
    pub sector: String,
    pub price: Option<f64>,
    #[serde(rename = "Analyst_Count")]
    pub analyst_count: u32,
    #[serde(rename = "Market_Cap")]
    pub market_cap: f64,
    #[serde(rename = "NTM_EPS")]
    pub ntm_eps: Option<f64>,
    #[serde(rename = "NTM_PER")]
    pub ntm_per: f64,
    #[serde(rename = "Implied_Net_Income")]
    pub implied_net_income: f64,
    pub status: String,
    pub country: Country,
}

impl MergedRecord {
    /// Builds a backfill row. `ticker` must already be normalized; the country
    /// and the forward P/E are derived from it and the two values.
    pub fn backfill(date: NaiveDate, ticker: String, price: Option<f64>, ntm_eps: Option<f64>) -> Self {
        let country = Country::from_ticker(&ticker);
        Self {
            date,
            ticker,
            name: HISTORICAL_PLACEHOLDER.to_string(),
            sector: HISTORICAL_PLACEHOLDER.to_string(),
            price,
            analyst_count: 0,
            market_cap: 0.0,
            ntm_eps,
            ntm_per: forward_per(price, ntm_eps),
            implied_net_income: 0.0,
            status: BACKFILL_STATUS.to_string(),
            country,
        }
    }

    pub fn date_key(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// Cells in `MASTER_COLUMNS` order.
    pub fn to_cells(&self) -> Vec<CellValue> {
        vec![
            CellValue::Text(self.date_key()),
            CellValue::Text(self.ticker.clone()),
            CellValue::Text(self.name.clone()),
            CellValue::Text(self.sector.clone()),
            self.price.into(),
            CellValue::Number(f64::from(self.analyst_count)),
            CellValue::Number(self.market_cap),
            self.ntm_eps.into(),
            CellValue::Number(self.ntm_per),
            CellValue::Number(self.implied_net_income),
            CellValue::Text(self.status.clone()),
            CellValue::Text(self.country.code().to_string()),
        ]
    }
}

/// Price over forward EPS, or a literal zero when either side is missing or
/// EPS is not positive.
pub fn forward_per(price: Option<f64>, ntm_eps: Option<f64>) -> f64 {
    match (price, ntm_eps) {
        (Some(p), Some(e)) if e > 0.0 => p / e,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_dates_count_from_the_spreadsheet_epoch() {
        assert_eq!(serial_to_date(0), Some(spreadsheet_epoch()));
        assert_eq!(serial_to_date(45149), NaiveDate::from_ymd_opt(2023, 8, 11));
        assert_eq!(serial_to_date(40001), NaiveDate::from_ymd_opt(2009, 7, 7));
        assert_eq!(serial_to_date(i64::MAX), None);
    }

    #[test]
    fn date_cells_render_as_iso() {
        assert_eq!(CellValue::DateTime(45149.0).render(), "2023-08-11");
        assert_eq!(CellValue::DateTime(45149.5).render(), "2023-08-11 12:00:00");
        assert_eq!(CellValue::Number(5930.0).render(), "5930");
        assert_eq!(CellValue::Number(1.25).render(), "1.25");
    }

    #[test]
    fn ticker_normalization_and_country() {
        assert_eq!(normalize_ticker(" AAPL-US "), "AAPL");
        assert_eq!(normalize_ticker("005930.KS"), "005930.KS");
        assert_eq!(Country::from_ticker("005930.KS"), Country::Kor);
        assert_eq!(Country::from_ticker("AAPL"), Country::Usa);
    }

    #[test]
    fn forward_per_guards_non_positive_eps() {
        assert_eq!(forward_per(Some(150.0), Some(5.0)), 30.0);
        assert_eq!(forward_per(Some(150.0), Some(0.0)), 0.0);
        assert_eq!(forward_per(Some(150.0), Some(-2.0)), 0.0);
        assert_eq!(forward_per(None, Some(5.0)), 0.0);
        assert_eq!(forward_per(Some(150.0), None), 0.0);
    }

    #[test]
    fn table_from_grid_pads_short_rows_and_drops_blank_ones() {
        let grid = SheetGrid::new(
            "USA_Stocks",
            vec![
                vec![CellValue::text("Date"), CellValue::text("Ticker"), CellValue::Empty],
                vec![CellValue::text("2023-01-01")],
                vec![CellValue::Empty, CellValue::text("  ")],
                vec![CellValue::text("2023-01-02"), CellValue::text("MSFT")],
            ],
        );
        let table = Table::from_grid(&grid);
        assert_eq!(table.columns, vec!["Date", "Ticker"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0][1], CellValue::Empty);
        assert_eq!(table.column_index("Ticker"), Some(1));
    }

    #[test]
    fn data_under_a_blank_trailing_header_is_kept() {
        let grid = SheetGrid::new(
            "USA_Stocks",
            vec![
                vec![CellValue::text("Date"), CellValue::text("Ticker")],
                vec![CellValue::text("2023-01-01"), CellValue::text("AAPL"), CellValue::Empty, CellValue::text("memo")],
            ],
        );
        let table = Table::from_grid(&grid);
        assert_eq!(table.columns, vec!["Date", "Ticker", "", ""]);
        assert_eq!(table.rows[0][3], CellValue::text("memo"));
    }

    #[test]
    fn backfill_rows_follow_master_column_order() {
        let record = MergedRecord::backfill(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            "AAPL".into(),
            Some(150.0),
            Some(5.0),
        );
        let cells = record.to_cells();
        assert_eq!(cells.len(), MASTER_COLUMNS.len());
        assert_eq!(cells[0], CellValue::text("2023-01-01"));
        assert_eq!(cells[8], CellValue::Number(30.0));
        assert_eq!(cells[10], CellValue::text(BACKFILL_STATUS));
        assert_eq!(cells[11], CellValue::text("USA"));
    }
}
