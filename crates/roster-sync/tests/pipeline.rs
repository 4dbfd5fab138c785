use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use roster_adapters::{ListingError, ListingPage, ListingSource, Termination};
use roster_core::{parse_collection_ids, CollectionId};
use roster_storage::{FetchError, StoreTarget};
use roster_sync::{SyncConfig, SyncError, SyncPipeline};
use tempfile::tempdir;

const SNAPSHOT: &str = "showroom/event_liver_list.csv";

/// Canned listing pages keyed by (collection, page). Unknown keys answer with
/// an empty page; `Err` stands in for a failing HTTP status.
#[derive(Clone, Default)]
struct ScriptedListing {
    pages: HashMap<(String, u64), Result<String, u16>>,
    requests: Arc<Mutex<usize>>,
}

impl ScriptedListing {
    fn page(mut self, collection: &str, page: u64, body: &str) -> Self {
        self.pages
            .insert((collection.to_string(), page), Ok(body.to_string()));
        self
    }

    fn failing(mut self, collection: &str, page: u64, status: u16) -> Self {
        self.pages.insert((collection.to_string(), page), Err(status));
        self
    }
}

#[async_trait]
impl ListingSource for ScriptedListing {
    async fn fetch_page(
        &self,
        collection_id: &CollectionId,
        page: u64,
    ) -> Result<ListingPage, ListingError> {
        *self.requests.lock().unwrap() += 1;
        match self.pages.get(&(collection_id.to_string(), page)) {
            Some(Ok(body)) => ListingPage::from_json_bytes(body.as_bytes()),
            Some(Err(status)) => Err(ListingError::Fetch(FetchError::HttpStatus {
                status: *status,
                url: format!("scripted://{collection_id}/{page}"),
            })),
            None => Ok(ListingPage::default()),
        }
    }
}

fn config_for(store_root: &Path) -> SyncConfig {
    let mut config = SyncConfig::from_lookup(|_| None);
    config.store = StoreTarget::LocalDir(store_root.to_path_buf());
    config.snapshot_path = SNAPSHOT.to_string();
    config.page_delay = Duration::ZERO;
    config
}

fn pipeline(config: SyncConfig, listing: ScriptedListing) -> SyncPipeline {
    SyncPipeline::new(config)
        .expect("pipeline")
        .with_listing_source(Box::new(listing))
}

fn read_snapshot(store_root: &Path) -> String {
    fs::read_to_string(store_root.join(SNAPSHOT)).expect("snapshot written")
}

fn seed_snapshot(store_root: &Path, contents: &str) {
    let path = store_root.join(SNAPSHOT);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn merges_fetched_participants_into_stored_snapshot() {
    let dir = tempdir().expect("tempdir");
    seed_snapshot(dir.path(), "100,10\n200,20\n");
    let listing = ScriptedListing::default()
        .page("15", 1, r#"{"list":[{"room_id":100,"event_entry":{"event_id":15}}],"next_page":2}"#)
        .page("15", 2, r#"{"list":[],"next_page":null}"#)
        .page("30", 1, r#"{"list":[{"room_id":"300","event_entry":{"event_id":"30"}}],"next_page":1}"#);

    let summary = pipeline(config_for(dir.path()), listing)
        .run_once(&parse_collection_ids("15,30"))
        .await
        .expect("sync");

    assert_eq!(read_snapshot(dir.path()), "100,15\n200,20\n300,30\n");
    assert_eq!(summary.fetched_records, 2);
    assert_eq!(summary.existing_records, 2);
    assert_eq!(summary.merged_records, 3);
    assert_eq!(summary.uploaded_bytes, Some("100,15\n200,20\n300,30\n".len()));
    assert!(summary.snapshot_sha256.is_some());
    assert_eq!(summary.collections[0].pages_requested, 2);
    assert_eq!(summary.collections[1].pages_requested, 1);
    assert_eq!(summary.aborted_collections().count(), 0);
}

#[tokio::test]
async fn first_run_without_snapshot_uploads_deduplicated_fetch() {
    let dir = tempdir().expect("tempdir");
    let listing = ScriptedListing::default().page(
        "1",
        1,
        r#"{"list":[
            {"room_id":5,"event_entry":{"event_id":1}},
            {"room_id":5,"event_entry":{"event_id":3}},
            {"room_id":6,"event_entry":{"event_id":2}}
        ]}"#,
    );

    let summary = pipeline(config_for(dir.path()), listing)
        .run_once(&parse_collection_ids("1"))
        .await
        .expect("sync");

    assert_eq!(summary.existing_records, 0);
    assert_eq!(read_snapshot(dir.path()), "5,3\n6,2\n");
}

#[tokio::test]
async fn corrupt_snapshot_is_replaced_by_fetched_records() {
    let dir = tempdir().expect("tempdir");
    seed_snapshot(dir.path(), "100,10,extra\n???\n");
    let listing = ScriptedListing::default()
        .page("1", 1, r#"{"list":[{"room_id":7,"event_entry":{"event_id":70}}]}"#);

    let summary = pipeline(config_for(dir.path()), listing)
        .run_once(&parse_collection_ids("1"))
        .await
        .expect("sync");

    assert_eq!(summary.existing_records, 0);
    assert_eq!(read_snapshot(dir.path()), "7,70\n");
}

#[tokio::test]
async fn short_row_in_snapshot_keeps_the_other_participants() {
    let dir = tempdir().expect("tempdir");
    seed_snapshot(dir.path(), "100,10\n200,20\n300,30\n400\n");
    let listing = ScriptedListing::default()
        .page("1", 1, r#"{"list":[{"room_id":7,"event_entry":{"event_id":70}}]}"#);

    let summary = pipeline(config_for(dir.path()), listing)
        .run_once(&parse_collection_ids("1"))
        .await
        .expect("sync");

    assert_eq!(summary.existing_records, 4);
    assert_eq!(summary.merged_records, 5);
    assert_eq!(read_snapshot(dir.path()), "100,10\n200,20\n300,30\n400,\n7,70\n");
}

#[tokio::test]
async fn aborted_collection_still_contributes_earlier_pages() {
    let dir = tempdir().expect("tempdir");
    let listing = ScriptedListing::default()
        .page("1", 1, r#"{"list":[{"room_id":1,"event_entry":{"event_id":1}}],"next_page":2}"#)
        .failing("1", 2, 502);

    let summary = pipeline(config_for(dir.path()), listing)
        .run_once(&parse_collection_ids("1"))
        .await
        .expect("sync");

    let aborted: Vec<_> = summary.aborted_collections().collect();
    assert_eq!(aborted.len(), 1);
    assert!(matches!(aborted[0].termination, Termination::Aborted { page: 2, .. }));
    assert_eq!(read_snapshot(dir.path()), "1,1\n");
}

#[tokio::test]
async fn nothing_fetched_leaves_store_untouched() {
    let dir = tempdir().expect("tempdir");
    seed_snapshot(dir.path(), "100,10\n");
    let listing = ScriptedListing::default().failing("9", 1, 500);

    let err = pipeline(config_for(dir.path()), listing)
        .run_once(&parse_collection_ids("9, 10"))
        .await
        .unwrap_err();

    match err {
        SyncError::NothingFetched { collections } => assert_eq!(collections, "9, 10"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(read_snapshot(dir.path()), "100,10\n");
}

#[tokio::test]
async fn no_collection_ids_is_rejected_before_fetching() {
    let dir = tempdir().expect("tempdir");
    let listing = ScriptedListing::default();
    let requests = listing.requests.clone();

    let err = pipeline(config_for(dir.path()), listing)
        .run_once(&parse_collection_ids("abc, \n"))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::NoCollections));
    assert_eq!(*requests.lock().unwrap(), 0);
}

#[tokio::test]
async fn upload_failure_is_a_hard_error() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("showroom"), b"a file where a directory should be").unwrap();
    let listing = ScriptedListing::default()
        .page("1", 1, r#"{"list":[{"room_id":1,"event_entry":{"event_id":1}}]}"#);

    let err = pipeline(config_for(dir.path()), listing)
        .run_once(&parse_collection_ids("1"))
        .await
        .unwrap_err();

    match err {
        SyncError::Upload { path, .. } => assert_eq!(path, SNAPSHOT),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_ftp_host_fails_at_store_connect() {
    let mut config = SyncConfig::from_lookup(|_| None);
    config.page_delay = Duration::ZERO;
    let listing = ScriptedListing::default()
        .page("1", 1, r#"{"list":[{"room_id":1,"event_entry":{"event_id":1}}]}"#);

    let err = pipeline(config, listing)
        .run_once(&parse_collection_ids("1"))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::StoreConnect { .. }), "{err}");
}

#[tokio::test]
async fn dry_run_reconciles_without_uploading() {
    let dir = tempdir().expect("tempdir");
    seed_snapshot(dir.path(), "100,10\n");
    let mut config = config_for(dir.path());
    config.dry_run = true;
    let listing = ScriptedListing::default()
        .page("1", 1, r#"{"list":[{"room_id":100,"event_entry":{"event_id":11}}]}"#);

    let summary = pipeline(config, listing)
        .run_once(&parse_collection_ids("1"))
        .await
        .expect("sync");

    assert!(summary.dry_run);
    assert_eq!(summary.uploaded_bytes, None);
    assert_eq!(summary.snapshot.len(), 1);
    assert_eq!(summary.snapshot[0].event_id, "11");
    assert_eq!(read_snapshot(dir.path()), "100,10\n");
}

#[tokio::test]
async fn current_snapshot_reads_what_the_last_run_uploaded() {
    let dir = tempdir().expect("tempdir");
    let listing = ScriptedListing::default()
        .page("1", 1, r#"{"list":[{"room_id":2,"event_entry":{"event_id":4}}]}"#);
    let pipeline = pipeline(config_for(dir.path()), listing);

    assert!(pipeline.current_snapshot().await.expect("empty store").is_empty());
    pipeline
        .run_once(&parse_collection_ids("1"))
        .await
        .expect("sync");
    let records = pipeline.current_snapshot().await.expect("snapshot");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].participant_id, "2");
    assert_eq!(records[0].event_id, "4");
}
