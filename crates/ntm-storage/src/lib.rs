//! Workbook storage (read any sheet, rewrite named sheets atomically) and the
//! shared HTTP client used by the remote adapters.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use calamine::{open_workbook_auto, CellErrorType, Data, Range, Reader, Sheets};
use ntm_core::{CellValue, SheetGrid};
use reqwest::{Method, RequestBuilder, StatusCode};
use rust_xlsxwriter::{Format, Formula, Workbook, XlsxError};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ntm-storage";

const DATE_NUM_FORMAT: &str = "yyyy-mm-dd";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("opening workbook {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },
    #[error("sheet '{sheet}' not found in {path}")]
    SheetNotFound { path: PathBuf, sheet: String },
    #[error("reading sheet '{sheet}' of {path}: {source}")]
    ReadSheet {
        path: PathBuf,
        sheet: String,
        #[source]
        source: calamine::Error,
    },
    #[error("sheet '{sheet}' has {columns} columns, more than a worksheet can hold")]
    TooWide { sheet: String, columns: usize },
    #[error("building workbook: {0}")]
    Write(#[from] XlsxError),
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Spreadsheet file on disk. Reads `.xlsb`, `.xlsx`, `.xls` and `.ods`; writes `.xlsx`.
#[derive(Debug, Clone)]
pub struct WorkbookStore {
    path: PathBuf,
}

impl WorkbookStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn sheet_names(&self) -> Result<Vec<String>, StorageError> {
        let workbook = open_workbook_auto(&self.path).map_err(|source| StorageError::Open {
            path: self.path.clone(),
            source,
        })?;
        Ok(workbook.sheet_names())
    }

    pub fn read_sheet(&self, sheet: &str) -> Result<SheetGrid, StorageError> {
        let mut workbook = open_workbook_auto(&self.path).map_err(|source| StorageError::Open {
            path: self.path.clone(),
            source,
        })?;
        if !workbook.sheet_names().iter().any(|name| name == sheet) {
            return Err(StorageError::SheetNotFound {
                path: self.path.clone(),
                sheet: sheet.to_string(),
            });
        }
        self.load_grid(&mut workbook, sheet)
    }

    /// Every sheet in workbook order.
    pub fn read_all(&self) -> Result<Vec<SheetGrid>, StorageError> {
        let mut workbook = open_workbook_auto(&self.path).map_err(|source| StorageError::Open {
            path: self.path.clone(),
            source,
        })?;
        let names = workbook.sheet_names();
        let mut sheets = Vec::with_capacity(names.len());
        for name in names {
            sheets.push(self.load_grid(&mut workbook, &name)?);
        }
        Ok(sheets)
    }

    /// Cell values plus formula text. Formats without formula support only
    /// lose the formulas, with a warning.
    fn load_grid<RS: Read + Seek>(
        &self,
        workbook: &mut Sheets<RS>,
        sheet: &str,
    ) -> Result<SheetGrid, StorageError> {
        let range = workbook
            .worksheet_range(sheet)
            .map_err(|source| StorageError::ReadSheet {
                path: self.path.clone(),
                sheet: sheet.to_string(),
                source,
            })?;
        let mut grid = range_to_grid(sheet, &range);
        match workbook.worksheet_formula(sheet) {
            Ok(formulas) => grid.formulas = formula_cells(&formulas),
            Err(err) => warn!(
                path = %self.path.display(),
                %sheet,
                error = %err,
                "formulas unavailable; values only"
            ),
        }
        Ok(grid)
    }

    /// Rewrites the workbook with `replacements` swapped in by sheet name.
    /// Sheets not named in `replacements` keep their position, cell values and
    /// formulas; replacements for sheets that do not exist yet are appended.
    pub fn replace_sheets(&self, replacements: &[SheetGrid]) -> Result<(), StorageError> {
        let mut sheets = if self.exists() {
            self.read_all()?
        } else {
            Vec::new()
        };
        for replacement in replacements {
            match sheets.iter_mut().find(|s| s.name == replacement.name) {
                Some(existing) => *existing = replacement.clone(),
                None => sheets.push(replacement.clone()),
            }
        }
        self.write_all(&sheets)
    }

    /// Writes `sheets` as the complete workbook via temp file + rename.
    pub fn write_all(&self, sheets: &[SheetGrid]) -> Result<(), StorageError> {
        let bytes = build_xlsx(sheets)?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        fs::write(&temp_path, &bytes).map_err(|source| StorageError::Io {
            path: temp_path.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(StorageError::Io {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

/// Pads the used range back out to absolute (0, 0) so row/column indices match
/// what a spreadsheet user sees.
fn range_to_grid(name: &str, range: &Range<Data>) -> SheetGrid {
    let Some((start_row, start_col)) = range.start() else {
        return SheetGrid::new(name, Vec::new());
    };
    let mut rows: Vec<Vec<CellValue>> = vec![Vec::new(); start_row as usize];
    for row in range.rows() {
        let mut cells = vec![CellValue::Empty; start_col as usize];
        cells.extend(row.iter().map(data_to_cell));
        while cells.last().is_some_and(|c| *c == CellValue::Empty) {
            cells.pop();
        }
        rows.push(cells);
    }
    SheetGrid::new(name, rows)
}

fn formula_cells(range: &Range<String>) -> BTreeMap<(usize, usize), String> {
    let Some((start_row, start_col)) = range.start() else {
        return BTreeMap::new();
    };
    range
        .used_cells()
        .filter(|(_, _, formula)| !formula.is_empty())
        .map(|(row, col, formula)| {
            (
                (start_row as usize + row, start_col as usize + col),
                formula.clone(),
            )
        })
        .collect()
}

fn data_to_cell(data: &Data) -> CellValue {
    match data {
        Data::Empty => CellValue::Empty,
        Data::String(s) => CellValue::Text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::Bool(*b),
        Data::DateTime(dt) => CellValue::DateTime(dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
        Data::Error(e) => CellValue::Error(error_code(e).to_string()),
    }
}

fn error_code(err: &CellErrorType) -> &'static str {
    match err {
        CellErrorType::Div0 => "#DIV/0!",
        CellErrorType::NA => "#N/A",
        CellErrorType::Name => "#NAME?",
        CellErrorType::Null => "#NULL!",
        CellErrorType::Num => "#NUM!",
        CellErrorType::Ref => "#REF!",
        CellErrorType::Value => "#VALUE!",
        CellErrorType::GettingData => "#DATA!",
    }
}

fn build_xlsx(sheets: &[SheetGrid]) -> Result<Vec<u8>, StorageError> {
    let mut workbook = Workbook::new();
    let date_format = Format::new().set_num_format(DATE_NUM_FORMAT);

    for sheet in sheets {
        let worksheet = workbook.add_worksheet();
        worksheet.set_name(&sheet.name)?;
        for (row_idx, row) in sheet.rows.iter().enumerate() {
            let row_num = u32::try_from(row_idx).map_err(|_| XlsxError::RowColumnLimitError)?;
            for (col_idx, cell) in row.iter().enumerate() {
                let col_num = u16::try_from(col_idx).map_err(|_| StorageError::TooWide {
                    sheet: sheet.name.clone(),
                    columns: row.len(),
                })?;
                match cell {
                    CellValue::Empty => {}
                    CellValue::Text(s) => {
                        worksheet.write_string(row_num, col_num, s)?;
                    }
                    CellValue::Number(n) if n.is_finite() => {
                        worksheet.write_number(row_num, col_num, *n)?;
                    }
                    CellValue::Number(_) => {}
                    CellValue::Bool(b) => {
                        worksheet.write_boolean(row_num, col_num, *b)?;
                    }
                    CellValue::DateTime(serial) => {
                        worksheet.write_number_with_format(row_num, col_num, *serial, &date_format)?;
                    }
                    CellValue::Error(code) => {
                        worksheet.write_string(row_num, col_num, code)?;
                    }
                }
            }
        }
        for (&(row_idx, col_idx), text) in &sheet.formulas {
            let row_num = u32::try_from(row_idx).map_err(|_| XlsxError::RowColumnLimitError)?;
            let col_num = u16::try_from(col_idx).map_err(|_| StorageError::TooWide {
                sheet: sheet.name.clone(),
                columns: col_idx + 1,
            })?;
            let mut formula = Formula::new(text.as_str());
            if let Some(result) = sheet
                .cell(row_idx, col_idx)
                .map(CellValue::render)
                .filter(|r| !r.is_empty())
            {
                formula = formula.set_result(result);
            }
            worksheet.write_formula(row_num, col_num, formula)?;
        }
    }

    Ok(workbook.save_to_buffer()?)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some("ntm-master/0.1".to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(err) => err.status(),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status).ok(),
        }
    }
}

/// JSON-over-HTTP client with a fixed timeout. No retries: a failed call
/// surfaces to the caller immediately.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Sends the request and decodes a JSON body, turning non-2xx responses
    /// into [`FetchError::HttpStatus`] with the response text attached.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, FetchError> {
        let request = request.build()?;
        let span = info_span!("http", method = %request.method(), url = %request.url());

        async move {
            let resp = self.client.execute(request).await?;
            let status = resp.status();
            let url = resp.url().to_string();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url,
                    body,
                });
            }
            Ok(resp.json::<T>().await?)
        }
        .instrument(span)
        .await
    }
}
