//! Sheets-to-Firestore sync: one collection per worksheet, documents keyed by
//! `{key}_{date}`, merge-upserted in bounded batches.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ntm_adapters::{
    AdapterError, DocumentStore, FirestoreStore, GoogleSheetsSource, ServiceAccountKey,
    SheetRecord, SheetSource, SpreadsheetRef, TokenProvider, WriteBatch, DATASTORE_SCOPE,
    DRIVE_READONLY_SCOPE, SHEETS_READONLY_SCOPE,
};
use ntm_core::DATE_COLUMN;
use ntm_storage::{HttpClient, HttpClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ntm-sync";

/// Writes per commit. Stays under the store's 500-operation hard limit.
pub const DEFAULT_BATCH_FLUSH_SIZE: usize = 450;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub sheets_key: PathBuf,
    pub firestore_key: PathBuf,
    pub spreadsheet: SpreadsheetRef,
    pub targets_file: Option<PathBuf>,
    pub interval: Duration,
    pub batch_flush_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let spreadsheet = match std::env::var("NTM_SPREADSHEET_ID") {
            Ok(id) if !id.trim().is_empty() => SpreadsheetRef::Id(id),
            _ => SpreadsheetRef::Name(
                std::env::var("NTM_SPREADSHEET_NAME").unwrap_or_else(|_| "Stock Data".to_string()),
            ),
        };
        Self {
            workspace_root: std::env::var("NTM_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            sheets_key: std::env::var("NTM_SHEETS_KEY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("stock-key.json")),
            firestore_key: std::env::var("NTM_FIRESTORE_KEY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("firebase-key.json")),
            spreadsheet,
            targets_file: std::env::var("NTM_SYNC_TARGETS").ok().map(PathBuf::from),
            interval: std::env::var("NTM_SYNC_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SYNC_INTERVAL),
            batch_flush_size: std::env::var("NTM_SYNC_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_FLUSH_SIZE),
            http_timeout_secs: std::env::var("NTM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("NTM_USER_AGENT")
                .unwrap_or_else(|_| "ntm-master/0.1".to_string()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    pub fn load_targets(&self) -> Result<Vec<SyncTarget>> {
        let Some(file) = &self.targets_file else {
            return Ok(default_targets());
        };
        let path = self.resolve(file);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let targets: Vec<SyncTarget> = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        if targets.is_empty() {
            bail!("{} lists no sync targets", path.display());
        }
        Ok(targets)
    }
}

/// Worksheet mirrored into the collection of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub worksheet: String,
    pub key_field: String,
    /// A missing worksheet is skipped instead of failing the collection.
    #[serde(default)]
    pub optional: bool,
}

impl SyncTarget {
    pub fn new(worksheet: &str, key_field: &str) -> Self {
        Self {
            worksheet: worksheet.to_string(),
            key_field: key_field.to_string(),
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

pub fn default_targets() -> Vec<SyncTarget> {
    vec![
        SyncTarget::new("USA_Stocks", "Ticker"),
        SyncTarget::new("Sector_Trend", "Sector"),
        SyncTarget::new("KOR_Stocks", "Ticker").optional(),
    ]
}

/// `{key}_{date}` with characters the store rejects in ids replaced. `None`
/// when both parts are empty.
pub fn document_id(key: &str, date: &str) -> Option<String> {
    let safe_key = key.trim().replace('/', "_").replace(' ', "_");
    let safe_date = date.trim().replace('/', "-").replace(' ', "_");
    let id = format!("{safe_key}_{safe_date}");
    if id.is_empty() || id == "_" {
        None
    } else {
        Some(id)
    }
}

/// Missing, null, empty text, zero and `false` all count as no value.
fn is_blank(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        Some(JsonValue::Bool(b)) => !b,
        Some(JsonValue::Number(n)) => n.as_f64() == Some(0.0),
        Some(JsonValue::Array(a)) => a.is_empty(),
        Some(JsonValue::Object(o)) => o.is_empty(),
    }
}

fn field_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Whether neither the date nor the key field carries a value.
pub fn is_empty_row(record: &SheetRecord, key_field: &str) -> bool {
    is_blank(record.get(DATE_COLUMN)) && is_blank(record.get(key_field))
}

/// Stringifies the record's `Date` in place and returns its document id, or
/// `None` when the row should be skipped.
pub fn prepare_record(record: &mut SheetRecord, key_field: &str) -> Option<String> {
    if is_empty_row(record, key_field) {
        return None;
    }
    if let Some(date) = record.get_mut(DATE_COLUMN) {
        if !is_blank(Some(&*date)) && !date.is_string() {
            let text = field_text(Some(&*date));
            *date = JsonValue::String(text);
        }
    }
    let key = field_text(record.get(key_field));
    let date = field_text(record.get(DATE_COLUMN));
    document_id(&key, &date)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Synced,
    Empty,
    MissingOptional,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionOutcome {
    pub collection: String,
    pub status: CollectionStatus,
    pub synced: usize,
    pub skipped: usize,
    pub commits: usize,
    pub error: Option<String>,
}

impl CollectionOutcome {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            status: CollectionStatus::Synced,
            synced: 0,
            skipped: 0,
            commits: 0,
            error: None,
        }
    }
}

async fn commit_pending(
    store: &dyn DocumentStore,
    batch: &mut WriteBatch,
    outcome: &mut CollectionOutcome,
) -> Result<(), AdapterError> {
    let pending = std::mem::take(batch);
    let size = pending.len();
    store.commit(pending).await?;
    outcome.synced += size;
    outcome.commits += 1;
    debug!(collection = %outcome.collection, synced = outcome.synced, "batch committed");
    Ok(())
}

async fn upsert_worksheet(
    source: &dyn SheetSource,
    store: &dyn DocumentStore,
    target: &SyncTarget,
    flush_size: usize,
    outcome: &mut CollectionOutcome,
) -> Result<(), AdapterError> {
    let records = source.worksheet_records(&target.worksheet).await?;
    if records.is_empty() {
        outcome.status = CollectionStatus::Empty;
        return Ok(());
    }

    let mut batch = WriteBatch::new();
    for mut record in records {
        let Some(doc_id) = prepare_record(&mut record, &target.key_field) else {
            outcome.skipped += 1;
            continue;
        };
        batch.set_merge(&target.worksheet, &doc_id, record);
        if batch.len() >= flush_size {
            commit_pending(store, &mut batch, outcome).await?;
        }
    }
    if !batch.is_empty() {
        commit_pending(store, &mut batch, outcome).await?;
    }
    Ok(())
}

/// Mirrors one worksheet into its collection. Failures are logged and
/// reported in the outcome; batches already committed stay committed.
pub async fn sync_collection(
    source: &dyn SheetSource,
    store: &dyn DocumentStore,
    target: &SyncTarget,
    flush_size: usize,
) -> CollectionOutcome {
    let mut outcome = CollectionOutcome::new(&target.worksheet);
    info!(collection = %target.worksheet, key_field = %target.key_field, "collection sync started");

    match upsert_worksheet(source, store, target, flush_size, &mut outcome).await {
        Ok(()) if outcome.status == CollectionStatus::Empty => {
            info!(collection = %target.worksheet, "worksheet has no rows");
        }
        Ok(()) => {
            info!(
                collection = %target.worksheet,
                synced = outcome.synced,
                skipped = outcome.skipped,
                commits = outcome.commits,
                "collection synced"
            );
        }
        Err(AdapterError::WorksheetNotFound(worksheet)) if target.optional => {
            warn!(%worksheet, "optional worksheet missing; skipped");
            outcome.status = CollectionStatus::MissingOptional;
        }
        Err(err) => {
            error!(collection = %target.worksheet, error = %err, "collection sync failed");
            outcome.status = CollectionStatus::Failed;
            outcome.error = Some(err.to_string());
        }
    }
    outcome
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the spreadsheet could not be opened; no collection was attempted.
    pub aborted: Option<String>,
    pub collections: Vec<CollectionOutcome>,
}

impl SyncRunSummary {
    pub fn total_synced(&self) -> usize {
        self.collections.iter().map(|c| c.synced).sum()
    }

    pub fn failed(&self) -> usize {
        self.collections
            .iter()
            .filter(|c| c.status == CollectionStatus::Failed)
            .count()
    }
}

pub struct SyncPipeline {
    source: Arc<dyn SheetSource>,
    store: Arc<dyn DocumentStore>,
    targets: Vec<SyncTarget>,
    flush_size: usize,
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn SheetSource>,
        store: Arc<dyn DocumentStore>,
        targets: Vec<SyncTarget>,
        flush_size: usize,
    ) -> Result<Self> {
        let limit = store.max_batch_size();
        if flush_size == 0 || flush_size > limit {
            bail!("batch flush size {flush_size} must be between 1 and {limit}");
        }
        Ok(Self {
            source,
            store,
            targets,
            flush_size,
        })
    }

    pub fn targets(&self) -> &[SyncTarget] {
        &self.targets
    }

    /// One pass over every target, in order. A failing collection never
    /// stops the ones after it, but failing to open the spreadsheet ends the
    /// pass before any collection is touched.
    pub async fn run_once(&self) -> SyncRunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, targets = self.targets.len(), "sync run started");

        if let Err(err) = self.source.open().await {
            error!(%run_id, error = %err, "opening spreadsheet failed; sync run aborted");
            return SyncRunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                aborted: Some(err.to_string()),
                collections: Vec::new(),
            };
        }

        let mut collections = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            collections.push(
                sync_collection(
                    self.source.as_ref(),
                    self.store.as_ref(),
                    target,
                    self.flush_size,
                )
                .await,
            );
        }

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            aborted: None,
            collections,
        };
        info!(
            %run_id,
            synced = summary.total_synced(),
            failed = summary.failed(),
            "sync run finished"
        );
        summary
    }
}

/// Runs a pass immediately, then one pass per `interval` of idle time, until
/// `cancel` fires. A pass in flight is abandoned on cancellation. Returns the
/// number of completed passes.
pub async fn run_daemon(
    pipeline: &SyncPipeline,
    interval: Duration,
    cancel: CancellationToken,
) -> usize {
    info!(interval_secs = interval.as_secs(), "sync daemon started");
    let mut passes = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = pipeline.run_once() => passes += 1,
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!(passes, "sync daemon stopped");
    passes
}

/// Loads both service-account keys and wires the REST clients. Credential
/// problems abort here, before any pass runs.
pub fn build_pipeline(config: &SyncConfig) -> Result<SyncPipeline> {
    let http = HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;

    let sheets_key = ServiceAccountKey::from_file(config.resolve(&config.sheets_key))?;
    let firestore_key = ServiceAccountKey::from_file(config.resolve(&config.firestore_key))?;
    let sheets_auth = TokenProvider::new(
        sheets_key,
        &[SHEETS_READONLY_SCOPE, DRIVE_READONLY_SCOPE],
        http.clone(),
    )?;
    let firestore_auth = TokenProvider::new(firestore_key, &[DATASTORE_SCOPE], http.clone())?;

    let source = GoogleSheetsSource::new(http.clone(), sheets_auth, config.spreadsheet.clone());
    let store = FirestoreStore::new(http, firestore_auth)?;
    SyncPipeline::new(
        Arc::new(source),
        Arc::new(store),
        config.load_targets()?,
        config.batch_flush_size,
    )
}

fn build_pipeline_or_log(config: &SyncConfig) -> Result<SyncPipeline> {
    build_pipeline(config)
        .inspect_err(|err| error!(error = %format!("{err:#}"), "sync setup failed"))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = build_pipeline_or_log(&config)?;
    Ok(pipeline.run_once().await)
}

pub async fn run_sync_daemon_from_env(cancel: CancellationToken) -> Result<usize> {
    let config = SyncConfig::from_env();
    let pipeline = build_pipeline_or_log(&config)?;
    Ok(run_daemon(&pipeline, config.interval, cancel).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntm_adapters::{MemoryDocumentStore, MemorySheetSource};
    use serde_json::json;

    fn record(pairs: &[(&str, JsonValue)]) -> SheetRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn stock_rows(count: usize) -> Vec<SheetRecord> {
        (0..count)
            .map(|i| {
                record(&[
                    ("Date", json!("2023-01-01")),
                    ("Ticker", json!(format!("T{i:04}"))),
                    ("Price", json!(i)),
                ])
            })
            .collect()
    }

    fn pipeline(
        source: MemorySheetSource,
        store: Arc<MemoryDocumentStore>,
        targets: Vec<SyncTarget>,
    ) -> SyncPipeline {
        SyncPipeline::new(Arc::new(source), store, targets, DEFAULT_BATCH_FLUSH_SIZE)
            .expect("pipeline")
    }

    #[test]
    fn document_ids_replace_separators() {
        assert_eq!(document_id("AAPL", "2023/01/01").as_deref(), Some("AAPL_2023-01-01"));
        assert_eq!(
            document_id("AAPL B", "2023-01 01").as_deref(),
            Some("AAPL_B_2023-01_01")
        );
        assert_eq!(document_id("IT/Tech", "").as_deref(), Some("IT_Tech_"));
        assert_eq!(document_id("", ""), None);
        assert_eq!(document_id(" ", " "), None);
    }

    #[test]
    fn blank_rows_are_skipped_and_dates_stringified() {
        let mut blank = record(&[("Date", json!("")), ("Ticker", json!("")), ("Price", json!(1))]);
        assert_eq!(prepare_record(&mut blank, "Ticker"), None);

        let mut numeric_date = record(&[("Date", json!(45000)), ("Ticker", json!("MSFT"))]);
        assert_eq!(
            prepare_record(&mut numeric_date, "Ticker").as_deref(),
            Some("MSFT_45000")
        );
        assert_eq!(numeric_date["Date"], json!("45000"));

        let mut key_only = record(&[("Sector", json!("Energy"))]);
        assert_eq!(prepare_record(&mut key_only, "Sector").as_deref(), Some("Energy_"));
        assert!(!key_only.contains_key("Date"));
    }

    #[test]
    fn flush_size_must_fit_the_store_limit() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        let source: Arc<dyn SheetSource> = Arc::new(MemorySheetSource::new());
        assert!(SyncPipeline::new(source.clone(), store.clone(), default_targets(), 0).is_err());
        assert!(SyncPipeline::new(source.clone(), store.clone(), default_targets(), 501).is_err());
        assert!(SyncPipeline::new(source, store, default_targets(), 500).is_ok());
    }

    #[tokio::test]
    async fn large_worksheets_commit_in_flush_sized_batches() {
        let store = Arc::new(MemoryDocumentStore::new());
        let source = MemorySheetSource::new().with_worksheet("USA_Stocks", stock_rows(1000));
        let summary = pipeline(source, store.clone(), vec![SyncTarget::new("USA_Stocks", "Ticker")])
            .run_once()
            .await;

        assert_eq!(store.commit_sizes(), vec![450, 450, 100]);
        assert_eq!(summary.collections[0].commits, 3);
        assert_eq!(summary.total_synced(), 1000);
        assert_eq!(store.document_ids("USA_Stocks").len(), 1000);
    }

    #[tokio::test]
    async fn upserts_merge_into_existing_documents() {
        let store = Arc::new(MemoryDocumentStore::new());
        let first = MemorySheetSource::new().with_worksheet(
            "USA_Stocks",
            vec![record(&[
                ("Date", json!("2023/01/01")),
                ("Ticker", json!("AAPL")),
                ("Name", json!("Apple")),
            ])],
        );
        pipeline(first, store.clone(), vec![SyncTarget::new("USA_Stocks", "Ticker")])
            .run_once()
            .await;

        let second = MemorySheetSource::new().with_worksheet(
            "USA_Stocks",
            vec![record(&[
                ("Date", json!("2023/01/01")),
                ("Ticker", json!("AAPL")),
                ("Price", json!(150)),
            ])],
        );
        pipeline(second, store.clone(), vec![SyncTarget::new("USA_Stocks", "Ticker")])
            .run_once()
            .await;

        let doc = store.document("USA_Stocks", "AAPL_2023-01-01").expect("document");
        assert_eq!(doc["Name"], json!("Apple"));
        assert_eq!(doc["Price"], json!(150));
        assert_eq!(store.document_ids("USA_Stocks").len(), 1);
    }

    #[tokio::test]
    async fn failing_collection_does_not_stop_the_others() {
        let store = Arc::new(MemoryDocumentStore::new().failing_on("USA_Stocks"));
        let source = MemorySheetSource::new()
            .with_worksheet("USA_Stocks", stock_rows(3))
            .with_worksheet(
                "Sector_Trend",
                vec![record(&[("Date", json!("2023-01-01")), ("Sector", json!("Energy"))])],
            );
        let summary = pipeline(source, store.clone(), default_targets()).run_once().await;

        let statuses: Vec<CollectionStatus> = summary.collections.iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                CollectionStatus::Failed,
                CollectionStatus::Synced,
                CollectionStatus::MissingOptional,
            ]
        );
        assert!(summary.collections[0].error.is_some());
        assert_eq!(summary.failed(), 1);
        assert!(store.document("Sector_Trend", "Energy_2023-01-01").is_some());
        assert!(store.document_ids("USA_Stocks").is_empty());
    }

    #[tokio::test]
    async fn unreachable_spreadsheet_aborts_before_any_collection() {
        let store = Arc::new(MemoryDocumentStore::new());
        let source = MemorySheetSource::new()
            .with_worksheet("USA_Stocks", stock_rows(2))
            .with_worksheet(
                "Sector_Trend",
                vec![record(&[("Date", json!("2023-01-01")), ("Sector", json!("Energy"))])],
            )
            .unreachable("Stock Data");
        let summary = pipeline(source, store.clone(), default_targets()).run_once().await;

        assert!(summary
            .aborted
            .as_deref()
            .is_some_and(|reason| reason.contains("Stock Data")));
        assert!(summary.collections.is_empty());
        assert!(store.commit_sizes().is_empty());
        assert!(store.document_ids("Sector_Trend").is_empty());
    }

    #[tokio::test]
    async fn missing_required_worksheet_fails_its_collection() {
        let store = Arc::new(MemoryDocumentStore::new());
        let summary = pipeline(
            MemorySheetSource::new(),
            store,
            vec![SyncTarget::new("Sector_Trend", "Sector")],
        )
        .run_once()
        .await;
        assert_eq!(summary.collections[0].status, CollectionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn daemon_runs_immediately_then_every_interval_until_cancelled() {
        let store = Arc::new(MemoryDocumentStore::new());
        let source = MemorySheetSource::new().with_worksheet("USA_Stocks", stock_rows(2));
        let pipeline = Arc::new(pipeline(
            source,
            store.clone(),
            vec![SyncTarget::new("USA_Stocks", "Ticker")],
        ));
        let cancel = CancellationToken::new();

        let handle = {
            let pipeline = pipeline.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { run_daemon(&pipeline, Duration::from_secs(600), cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1300)).await;
        cancel.cancel();
        let passes = handle.await.expect("daemon task");

        assert_eq!(passes, 3);
        assert_eq!(store.commit_sizes(), vec![2, 2, 2]);
    }

    #[test]
    fn missing_credentials_fail_setup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = SyncConfig::from_env();
        config.workspace_root = dir.path().to_path_buf();
        config.sheets_key = PathBuf::from("stock-key.json");
        config.targets_file = None;

        let Err(err) = build_pipeline_or_log(&config) else {
            panic!("pipeline built without credentials");
        };
        assert!(format!("{err:#}").contains("stock-key.json"));
    }

    #[test]
    fn targets_load_from_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("targets.yaml"),
            "- { worksheet: USA_Stocks, key_field: Ticker }\n- { worksheet: KOR_Stocks, key_field: Ticker, optional: true }\n",
        )
        .expect("write targets");

        let mut config = SyncConfig::from_env();
        config.workspace_root = dir.path().to_path_buf();
        config.targets_file = Some(PathBuf::from("targets.yaml"));
        let targets = config.load_targets().expect("targets");
        assert_eq!(
            targets,
            vec![
                SyncTarget::new("USA_Stocks", "Ticker"),
                SyncTarget::new("KOR_Stocks", "Ticker").optional(),
            ]
        );
    }
}
