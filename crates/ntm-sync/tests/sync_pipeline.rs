use std::sync::Arc;

use ntm_adapters::{rows_to_records, MemoryDocumentStore, MemorySheetSource};
use ntm_sync::{default_targets, CollectionStatus, SyncPipeline, DEFAULT_BATCH_FLUSH_SIZE};
use serde_json::{json, Value as JsonValue};

fn sheet(rows: &[&[&str]]) -> Vec<ntm_adapters::SheetRecord> {
    rows_to_records(
        rows.iter()
            .map(|row| row.iter().map(|cell| JsonValue::from(*cell)).collect())
            .collect(),
    )
}

#[tokio::test]
async fn formatted_worksheets_land_in_matching_collections() {
    let usa = sheet(&[
        &["Date", "Ticker", "Name", "Price", "NTM_PER"],
        &["2023/08/11", "AAPL", "Apple", "178.5", "29.3"],
        &["", "", "", "", ""],
        &["2023/08/11", "BRK B", "Berkshire", "352", "21"],
        &["2023/08/11", "MSFT"],
    ]);
    let sectors = sheet(&[
        &["Date", "Sector", "Avg_PER"],
        &["2023/08/11", "Info Tech", "27.1"],
    ]);
    let source = MemorySheetSource::new()
        .with_worksheet("USA_Stocks", usa)
        .with_worksheet("Sector_Trend", sectors)
        .with_worksheet("KOR_Stocks", Vec::new());
    let store = Arc::new(MemoryDocumentStore::new());

    let pipeline = SyncPipeline::new(
        Arc::new(source),
        store.clone(),
        default_targets(),
        DEFAULT_BATCH_FLUSH_SIZE,
    )
    .expect("pipeline");
    let summary = pipeline.run_once().await;

    assert_eq!(summary.collections.len(), 3);
    assert_eq!(summary.collections[0].synced, 3);
    assert_eq!(summary.collections[0].skipped, 1);
    assert_eq!(summary.collections[1].synced, 1);
    assert_eq!(summary.collections[2].status, CollectionStatus::Empty);

    let apple = store
        .document("USA_Stocks", "AAPL_2023-08-11")
        .expect("apple document");
    assert_eq!(apple["Date"], json!("2023/08/11"));
    assert_eq!(apple["Price"], json!(178.5));
    assert_eq!(apple["Name"], json!("Apple"));

    let msft = store
        .document("USA_Stocks", "MSFT_2023-08-11")
        .expect("short row is padded");
    assert_eq!(msft["Price"], json!(""));

    assert!(store.document("USA_Stocks", "BRK_B_2023-08-11").is_some());
    assert!(store.document("Sector_Trend", "Info_Tech_2023-08-11").is_some());
    assert_eq!(store.commit_sizes(), vec![3, 1]);
}
