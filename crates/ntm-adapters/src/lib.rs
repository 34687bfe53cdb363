//! Remote collaborator contracts (worksheet source, document store) and their
//! Google Sheets / Firestore REST implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use ntm_storage::{FetchError, HttpClient};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "ntm-adapters";

pub const SHEETS_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";
pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
pub const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_FILES_API: &str = "https://www.googleapis.com/drive/v3/files";
const FIRESTORE_API: &str = "https://firestore.googleapis.com/v1";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// One worksheet row keyed by header label.
pub type SheetRecord = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading credentials {path}: {reason}")]
    Credentials { path: PathBuf, reason: String },
    #[error("authenticating: {0}")]
    Auth(String),
    #[error("spreadsheet '{0}' not found")]
    SpreadsheetNotFound(String),
    #[error("worksheet '{0}' not found")]
    WorksheetNotFound(String),
    #[error("write batch of {0} operations exceeds the store limit")]
    BatchTooLarge(usize),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// Source of header-keyed worksheet rows.
#[async_trait]
pub trait SheetSource: Send + Sync {
    /// Connects to the spreadsheet before any worksheet is read. A failure
    /// here means no worksheet can be read in this run.
    async fn open(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// All data rows of `worksheet`; the first sheet row is the header.
    async fn worksheet_records(&self, worksheet: &str) -> Result<Vec<SheetRecord>, AdapterError>;
}

/// A single merge-upsert of `fields` into `collection/doc_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentWrite {
    pub collection: String,
    pub doc_id: String,
    pub fields: SheetRecord,
}

/// Writes that commit together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<DocumentWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a merge-upsert: existing fields not present in `fields` survive.
    pub fn set_merge(&mut self, collection: &str, doc_id: &str, fields: SheetRecord) {
        self.writes.push(DocumentWrite {
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            fields,
        });
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[DocumentWrite] {
        &self.writes
    }
}

/// Document store that accepts atomic write batches.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Hard per-batch operation limit of the backing store.
    fn max_batch_size(&self) -> usize {
        500
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), AdapterError>;
}

/// Fields of a service-account key file that the OAuth flow needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let credentials_err = |reason: String| AdapterError::Credentials {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| credentials_err(e.to_string()))?;
        let key: Self = serde_json::from_str(&text).map_err(|e| credentials_err(e.to_string()))?;
        EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| credentials_err(format!("private_key: {e}")))?;
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Exchanges a signed service-account assertion for bearer tokens and caches
/// them until shortly before expiry.
pub struct TokenProvider {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    scopes: Vec<String>,
    http: HttpClient,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(
        key: ServiceAccountKey,
        scopes: &[&str],
        http: HttpClient,
    ) -> Result<Self, AdapterError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| AdapterError::Auth(format!("invalid private key: {e}")))?;
        Ok(Self {
            key,
            encoding_key,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            http,
            cached: Mutex::new(None),
        })
    }

    pub fn project_id(&self) -> Option<&str> {
        self.key.project_id.as_deref()
    }

    pub async fn access_token(&self) -> Result<String, AdapterError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.signed_assertion()?;
        let request = self.http.request(Method::POST, &self.key.token_uri).form(&[
            ("grant_type", JWT_BEARER_GRANT),
            ("assertion", assertion.as_str()),
        ]);
        let resp: TokenResponse = self.http.send_json(request).await?;
        let lifetime = Duration::from_secs(resp.expires_in.unwrap_or(TOKEN_LIFETIME_SECS as u64));
        let token = CachedToken {
            value: resp.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        };
        debug!(client = %self.key.client_email, "obtained access token");
        *cached = Some(token.clone());
        Ok(token.value)
    }

    fn signed_assertion(&self) -> Result<String, AdapterError> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: self.scopes.join(" "),
            aud: &self.key.token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| AdapterError::Auth(format!("signing assertion: {e}")))
    }
}

/// Which spreadsheet to read: an explicit id, or a title resolved through Drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpreadsheetRef {
    Id(String),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Google Sheets v4 reader. Values come back formatted, the way a user sees
/// them, and are numericised per cell.
pub struct GoogleSheetsSource {
    http: HttpClient,
    auth: TokenProvider,
    spreadsheet: SpreadsheetRef,
    resolved_id: Mutex<Option<String>>,
}

impl GoogleSheetsSource {
    pub fn new(http: HttpClient, auth: TokenProvider, spreadsheet: SpreadsheetRef) -> Self {
        let resolved_id = match &spreadsheet {
            SpreadsheetRef::Id(id) => Some(id.clone()),
            SpreadsheetRef::Name(_) => None,
        };
        Self {
            http,
            auth,
            spreadsheet,
            resolved_id: Mutex::new(resolved_id),
        }
    }

    /// Resolves (once) and returns the spreadsheet id.
    pub async fn spreadsheet_id(&self) -> Result<String, AdapterError> {
        let mut resolved = self.resolved_id.lock().await;
        if let Some(id) = resolved.as_ref() {
            return Ok(id.clone());
        }
        let SpreadsheetRef::Name(name) = &self.spreadsheet else {
            return Err(AdapterError::Message("spreadsheet id missing".into()));
        };

        let query = format!(
            "name = '{}' and mimeType = '{SPREADSHEET_MIME}' and trashed = false",
            name.replace('\\', "\\\\").replace('\'', "\\'")
        );
        let token = self.auth.access_token().await?;
        let request = self
            .http
            .request(Method::GET, DRIVE_FILES_API)
            .bearer_auth(token)
            .query(&[("q", query.as_str()), ("fields", "files(id)"), ("pageSize", "1")]);
        let list: DriveFileList = self.http.send_json(request).await?;
        let id = list
            .files
            .into_iter()
            .next()
            .map(|f| f.id)
            .ok_or_else(|| AdapterError::SpreadsheetNotFound(name.clone()))?;
        info!(spreadsheet = %name, %id, "resolved spreadsheet");
        *resolved = Some(id.clone());
        Ok(id)
    }

    async fn worksheet_titles(&self, spreadsheet_id: &str) -> Result<Vec<String>, AdapterError> {
        let url = format!("{SHEETS_API}/{spreadsheet_id}");
        let token = self.auth.access_token().await?;
        let request = self
            .http
            .request(Method::GET, &url)
            .bearer_auth(token)
            .query(&[("fields", "sheets.properties.title")]);
        let meta: SpreadsheetMeta = self.http.send_json(request).await?;
        Ok(meta.sheets.into_iter().map(|s| s.properties.title).collect())
    }
}

#[async_trait]
impl SheetSource for GoogleSheetsSource {
    /// Resolves the spreadsheet and exchanges a token by listing its worksheets.
    async fn open(&self) -> Result<(), AdapterError> {
        let spreadsheet_id = self.spreadsheet_id().await?;
        let titles = self.worksheet_titles(&spreadsheet_id).await?;
        debug!(%spreadsheet_id, worksheets = titles.len(), "spreadsheet opened");
        Ok(())
    }

    async fn worksheet_records(&self, worksheet: &str) -> Result<Vec<SheetRecord>, AdapterError> {
        let spreadsheet_id = self.spreadsheet_id().await?;
        if !self
            .worksheet_titles(&spreadsheet_id)
            .await?
            .iter()
            .any(|t| t == worksheet)
        {
            return Err(AdapterError::WorksheetNotFound(worksheet.to_string()));
        }

        let mut url = Url::parse(SHEETS_API).map_err(|e| AdapterError::Message(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message("sheets api url cannot be a base".into()))?
            .push(&spreadsheet_id)
            .push("values")
            .push(&a1_sheet_range(worksheet));
        let token = self.auth.access_token().await?;
        let request = self
            .http
            .request(Method::GET, url.as_str())
            .bearer_auth(token)
            .query(&[("majorDimension", "ROWS"), ("valueRenderOption", "FORMATTED_VALUE")]);
        let range: ValueRange = self.http.send_json(request).await?;
        Ok(rows_to_records(range.values))
    }
}

/// Whole-sheet A1 range, quoted so names with spaces or punctuation resolve.
fn a1_sheet_range(worksheet: &str) -> String {
    format!("'{}'", worksheet.replace('\'', "''"))
}

/// First row is the header; shorter rows are padded with empty strings.
pub fn rows_to_records(mut rows: Vec<Vec<JsonValue>>) -> Vec<SheetRecord> {
    if rows.is_empty() {
        return Vec::new();
    }
    let header: Vec<String> = rows
        .remove(0)
        .into_iter()
        .map(|v| match v {
            JsonValue::String(s) => s,
            other => other.to_string(),
        })
        .collect();

    rows.into_iter()
        .map(|row| {
            let mut cells = row.into_iter();
            header
                .iter()
                .map(|key| {
                    let cell = cells.next().unwrap_or(JsonValue::String(String::new()));
                    (key.clone(), numericise(cell))
                })
                .collect()
        })
        .collect()
}

/// Integer, then float, else text. Text containing `_` and empty text stay as-is.
pub fn numericise(value: JsonValue) -> JsonValue {
    let JsonValue::String(text) = value else {
        return value;
    };
    if text.is_empty() || text.contains('_') {
        return JsonValue::String(text);
    }
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return JsonValue::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return JsonValue::Number(n);
        }
    }
    JsonValue::String(text)
}

/// Firestore v1 `documents:commit` writer. Each write carries an update mask
/// naming exactly the record's fields, which gives merge-upsert semantics.
pub struct FirestoreStore {
    http: HttpClient,
    auth: TokenProvider,
    project_id: String,
    database: String,
}

impl FirestoreStore {
    pub fn new(http: HttpClient, auth: TokenProvider) -> Result<Self, AdapterError> {
        let project_id = auth
            .project_id()
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Auth("service account key has no project_id".into()))?;
        Ok(Self {
            http,
            auth,
            project_id,
            database: "(default)".to_string(),
        })
    }

    fn documents_root(&self) -> String {
        format!("projects/{}/databases/{}/documents", self.project_id, self.database)
    }

    pub fn commit_body(&self, batch: &WriteBatch) -> JsonValue {
        let root = self.documents_root();
        let writes: Vec<JsonValue> = batch
            .writes()
            .iter()
            .map(|w| {
                json!({
                    "update": {
                        "name": format!("{root}/{}/{}", w.collection, w.doc_id),
                        "fields": encode_fields(&w.fields),
                    },
                    "updateMask": {
                        "fieldPaths": w.fields.keys().map(|k| field_path(k)).collect::<Vec<_>>(),
                    },
                })
            })
            .collect();
        json!({ "writes": writes })
    }
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), AdapterError> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.len() > self.max_batch_size() {
            return Err(AdapterError::BatchTooLarge(batch.len()));
        }
        let url = format!("{FIRESTORE_API}/{}:commit", self.documents_root());
        let token = self.auth.access_token().await?;
        let request = self
            .http
            .request(Method::POST, &url)
            .bearer_auth(token)
            .json(&self.commit_body(&batch));
        let _resp: JsonValue = self.http.send_json(request).await?;
        debug!(writes = batch.len(), "committed write batch");
        Ok(())
    }
}

/// Typed Firestore value for a JSON value.
pub fn encode_value(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Null => json!({ "nullValue": null }),
        JsonValue::Bool(b) => json!({ "booleanValue": b }),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        JsonValue::String(s) => json!({ "stringValue": s }),
        JsonValue::Array(items) => {
            json!({ "arrayValue": { "values": items.iter().map(encode_value).collect::<Vec<_>>() } })
        }
        JsonValue::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

pub fn encode_fields(fields: &Map<String, JsonValue>) -> JsonValue {
    JsonValue::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), encode_value(v)))
            .collect(),
    )
}

/// Bare identifiers pass through; anything else is backtick-quoted.
pub fn field_path(name: &str) -> String {
    let mut chars = name.chars();
    let simple = chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric());
    if simple {
        name.to_string()
    } else {
        format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
    }
}

/// In-memory worksheet source.
#[derive(Debug, Default)]
pub struct MemorySheetSource {
    worksheets: BTreeMap<String, Vec<SheetRecord>>,
    unreachable: Option<String>,
}

impl MemorySheetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worksheet(mut self, name: &str, records: Vec<SheetRecord>) -> Self {
        self.worksheets.insert(name.to_string(), records);
        self
    }

    /// `open` fails as if the spreadsheet `name` could not be found.
    pub fn unreachable(mut self, name: &str) -> Self {
        self.unreachable = Some(name.to_string());
        self
    }
}

#[async_trait]
impl SheetSource for MemorySheetSource {
    async fn open(&self) -> Result<(), AdapterError> {
        match &self.unreachable {
            Some(name) => Err(AdapterError::SpreadsheetNotFound(name.clone())),
            None => Ok(()),
        }
    }

    async fn worksheet_records(&self, worksheet: &str) -> Result<Vec<SheetRecord>, AdapterError> {
        self.worksheets
            .get(worksheet)
            .cloned()
            .ok_or_else(|| AdapterError::WorksheetNotFound(worksheet.to_string()))
    }
}

/// In-memory document store applying merge-upserts and recording each commit's size.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    state: StdMutex<MemoryStoreState>,
    fail_collections: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryStoreState {
    documents: BTreeMap<(String, String), SheetRecord>,
    commits: Vec<usize>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits touching `collection` fail without applying anything.
    pub fn failing_on(mut self, collection: &str) -> Self {
        self.fail_collections.push(collection.to_string());
        self
    }

    pub fn document(&self, collection: &str, doc_id: &str) -> Option<SheetRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .documents
            .get(&(collection.to_string(), doc_id.to_string()))
            .cloned()
    }

    pub fn document_ids(&self, collection: &str) -> Vec<String> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .documents
            .keys()
            .filter(|(c, _)| c == collection)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Operation count of every successful commit, in order.
    pub fn commit_sizes(&self) -> Vec<usize> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.commits.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), AdapterError> {
        if batch.len() > self.max_batch_size() {
            return Err(AdapterError::BatchTooLarge(batch.len()));
        }
        if let Some(w) = batch
            .writes()
            .iter()
            .find(|w| self.fail_collections.contains(&w.collection))
        {
            return Err(AdapterError::Message(format!(
                "commit rejected for collection {}",
                w.collection
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for w in batch.writes() {
            let doc = state
                .documents
                .entry((w.collection.clone(), w.doc_id.clone()))
                .or_default();
            for (k, v) in &w.fields {
                doc.insert(k.clone(), v.clone());
            }
        }
        state.commits.push(batch.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, JsonValue)]) -> SheetRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn records_are_keyed_by_header_and_padded() {
        let rows = vec![
            vec![json!("Date"), json!("Ticker"), json!("Price")],
            vec![json!("2023-01-01"), json!("AAPL"), json!("150.5")],
            vec![json!("2023-01-02"), json!("MSFT")],
        ];
        let records = rows_to_records(rows);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["Price"], json!(150.5));
        assert_eq!(records[1]["Price"], json!(""));
        assert_eq!(records[1]["Ticker"], json!("MSFT"));
    }

    #[test]
    fn numericise_matches_sheet_client_rules() {
        assert_eq!(numericise(json!("42")), json!(42));
        assert_eq!(numericise(json!("3.5")), json!(3.5));
        assert_eq!(numericise(json!("")), json!(""));
        assert_eq!(numericise(json!("1_000")), json!("1_000"));
        assert_eq!(numericise(json!("2023-01-01")), json!("2023-01-01"));
        assert_eq!(numericise(json!("1,234")), json!("1,234"));
        assert_eq!(numericise(json!("nan")), json!("nan"));
    }

    #[test]
    fn firestore_values_are_typed() {
        assert_eq!(encode_value(&json!(3)), json!({ "integerValue": "3" }));
        assert_eq!(encode_value(&json!(2.5)), json!({ "doubleValue": 2.5 }));
        assert_eq!(encode_value(&json!("x")), json!({ "stringValue": "x" }));
        assert_eq!(encode_value(&json!(true)), json!({ "booleanValue": true }));
        assert_eq!(encode_value(&JsonValue::Null), json!({ "nullValue": null }));
        assert_eq!(
            encode_value(&json!(["a"])),
            json!({ "arrayValue": { "values": [{ "stringValue": "a" }] } })
        );
    }

    #[test]
    fn field_paths_quote_non_identifiers() {
        assert_eq!(field_path("NTM_EPS"), "NTM_EPS");
        assert_eq!(field_path("Market Cap"), "`Market Cap`");
        assert_eq!(field_path("12M"), "`12M`");
        assert_eq!(field_path("a`b"), "`a\\`b`");
    }

    #[test]
    fn a1_ranges_quote_sheet_names() {
        assert_eq!(a1_sheet_range("USA_Stocks"), "'USA_Stocks'");
        assert_eq!(a1_sheet_range("Bob's"), "'Bob''s'");
    }

    #[test]
    fn missing_credentials_file_is_a_credentials_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ServiceAccountKey::from_file(dir.path().join("stock-key.json"))
            .expect_err("missing file");
        assert!(matches!(err, AdapterError::Credentials { .. }));
    }

    #[test]
    fn malformed_credentials_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("firebase-key.json");
        std::fs::write(
            &path,
            r#"{"client_email":"svc@example.iam.gserviceaccount.com","private_key":"not a key"}"#,
        )
        .expect("write");
        let err = ServiceAccountKey::from_file(&path).expect_err("bad key");
        assert!(matches!(err, AdapterError::Credentials { ref reason, .. } if reason.contains("private_key")));
    }

    #[tokio::test]
    async fn memory_store_merges_fields_into_existing_documents() {
        let store = MemoryDocumentStore::new();
        let mut first = WriteBatch::new();
        first.set_merge(
            "USA_Stocks",
            "AAPL_2023-01-01",
            record(&[("Price", json!(150)), ("Name", json!("Apple"))]),
        );
        store.commit(first).await.expect("first");

        let mut second = WriteBatch::new();
        second.set_merge("USA_Stocks", "AAPL_2023-01-01", record(&[("Price", json!(155))]));
        store.commit(second).await.expect("second");

        let doc = store.document("USA_Stocks", "AAPL_2023-01-01").expect("doc");
        assert_eq!(doc["Price"], json!(155));
        assert_eq!(doc["Name"], json!("Apple"));
        assert_eq!(store.commit_sizes(), vec![1, 1]);
    }

    #[tokio::test]
    async fn failing_commit_applies_nothing() {
        let store = MemoryDocumentStore::new().failing_on("Sector_Trend");
        let mut batch = WriteBatch::new();
        batch.set_merge("USA_Stocks", "A_1", SheetRecord::new());
        batch.set_merge("Sector_Trend", "Tech_1", SheetRecord::new());
        assert!(store.commit(batch).await.is_err());
        assert!(store.document_ids("USA_Stocks").is_empty());
        assert!(store.commit_sizes().is_empty());
    }
}
