//! Sync pipeline: fetch participants, merge with the stored snapshot, upload.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use roster_adapters::{
    FetchOutcome, HttpListingSource, ListingEndpoint, ListingSource, PaginatedFetcher,
    Termination, DEFAULT_PAGE_DELAY,
};
use roster_core::{CollectionId, ParticipationRecord};
use roster_storage::{
    FetchError, FtpSettings, HttpClientConfig, HttpFetcher, SnapshotStore, StoreError,
    StoreTarget, UploadReceipt,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub listing: ListingEndpoint,
    pub page_delay: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub store: StoreTarget,
    pub snapshot_path: String,
    pub dry_run: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let store = match var("ROSTER_STORE").as_deref() {
            Some("local") => StoreTarget::LocalDir(
                var("ROSTER_LOCAL_STORE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./store")),
            ),
            other => {
                if let Some(unknown) = other.filter(|v| *v != "ftp") {
                    warn!(value = unknown, "unknown ROSTER_STORE; using ftp");
                }
                StoreTarget::Ftp(FtpSettings {
                    host: var("ROSTER_FTP_HOST"),
                    port: var("ROSTER_FTP_PORT")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(21),
                    user: var("ROSTER_FTP_USER"),
                    password: var("ROSTER_FTP_PASSWORD"),
                    timeout: Duration::from_secs(
                        var("ROSTER_FTP_TIMEOUT_SECS")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(30),
                    ),
                })
            }
        };

        Self {
            listing: ListingEndpoint {
                url: var("ROSTER_API_URL").unwrap_or_else(|| {
                    "https://www.showroom-live.com/api/event/room_list".to_string()
                }),
                collection_param: var("ROSTER_COLLECTION_PARAM")
                    .unwrap_or_else(|| "event_id".to_string()),
                page_param: var("ROSTER_PAGE_PARAM").unwrap_or_else(|| "p".to_string()),
            },
            page_delay: var("ROSTER_PAGE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PAGE_DELAY),
            http_timeout_secs: var("ROSTER_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            user_agent: var("ROSTER_USER_AGENT").unwrap_or_else(|| "roster-bot/0.1".to_string()),
            store,
            snapshot_path: var("ROSTER_SNAPSHOT_PATH")
                .unwrap_or_else(|| "event_liver_list.csv".to_string()),
            dry_run: var("ROSTER_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

/// Numeric reading of an event id, used only to order candidates. Plain
/// decimals compare digit by digit so large ids keep their precision.
#[derive(Debug, Clone, PartialEq)]
enum EventRank {
    Unranked,
    Exact {
        negative: bool,
        whole: u128,
        fraction: String,
    },
    Float(f64),
}

impl EventRank {
    fn of(event_id: &str) -> Self {
        let trimmed = event_id.trim();
        if let Some(exact) = Self::exact(trimmed) {
            return exact;
        }
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => EventRank::Float(value),
            _ => EventRank::Unranked,
        }
    }

    /// `[+-]digits[.digits]` without loss; anything else is left to `f64`.
    fn exact(text: &str) -> Option<Self> {
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }
        let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(whole) || !all_digits(fraction) {
            return None;
        }
        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let fraction = fraction.trim_end_matches('0').to_string();
        let negative = negative && (whole != 0 || !fraction.is_empty());
        Some(EventRank::Exact {
            negative,
            whole,
            fraction,
        })
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (EventRank::Unranked, EventRank::Unranked) => Ordering::Equal,
            (EventRank::Unranked, _) => Ordering::Less,
            (_, EventRank::Unranked) => Ordering::Greater,
            (
                EventRank::Exact {
                    negative: a_neg,
                    whole: a_whole,
                    fraction: a_frac,
                },
                EventRank::Exact {
                    negative: b_neg,
                    whole: b_whole,
                    fraction: b_frac,
                },
            ) => match (a_neg, b_neg) {
                (false, true) => Ordering::Greater,
                (true, false) => Ordering::Less,
                // trailing zeros are stripped, so digit strings order like the fractions
                (false, false) => (a_whole, a_frac.as_str()).cmp(&(b_whole, b_frac.as_str())),
                (true, true) => (b_whole, b_frac.as_str()).cmp(&(a_whole, a_frac.as_str())),
            },
            (a, b) => a
                .as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal),
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            EventRank::Exact {
                negative,
                whole,
                fraction,
            } => {
                let magnitude = format!("{whole}.{fraction}0").parse().unwrap_or(f64::MAX);
                if *negative {
                    -magnitude
                } else {
                    magnitude
                }
            }
            EventRank::Float(v) => *v,
            EventRank::Unranked => f64::NEG_INFINITY,
        }
    }
}

/// Merge the stored snapshot with freshly fetched records, keeping one record
/// per participant: the one with the numerically greatest event id. On equal
/// rank the later record wins, so `incoming` beats `existing`. Event ids that
/// are not numbers never beat a numeric one, but a participant whose event ids
/// are all non-numeric still keeps its last record. Output is ordered by
/// participant id.
pub fn reconcile(
    existing: &[ParticipationRecord],
    incoming: &[ParticipationRecord],
) -> Vec<ParticipationRecord> {
    let mut groups: BTreeMap<&str, Vec<&ParticipationRecord>> = BTreeMap::new();
    for record in existing.iter().chain(incoming) {
        groups
            .entry(record.participant_id.as_str())
            .or_default()
            .push(record);
    }

    groups
        .into_values()
        .filter_map(|candidates| {
            let mut best: Option<(&ParticipationRecord, EventRank)> = None;
            for candidate in candidates {
                let rank = EventRank::of(&candidate.event_id);
                let keeps_current = matches!(
                    &best,
                    Some((_, best_rank)) if rank.compare(best_rank) == Ordering::Less
                );
                if !keeps_current {
                    best = Some((candidate, rank));
                }
            }
            best.map(|(record, _)| ParticipationRecord {
                participant_id: record.participant_id.clone(),
                event_id: record.event_id.clone(),
            })
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no numeric collection ids were given")]
    NoCollections,
    #[error("no participants fetched for collection(s) {collections}; store left untouched")]
    NothingFetched { collections: String },
    #[error("building http client: {0}")]
    HttpClient(#[from] FetchError),
    #[error("opening store {target}: {source}")]
    StoreConnect {
        target: String,
        #[source]
        source: StoreError,
    },
    #[error("uploading {path}: {source}")]
    Upload {
        path: String,
        #[source]
        source: StoreError,
    },
    #[error("store stage did not complete: {0}")]
    StoreTask(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub collection_id: CollectionId,
    pub records: usize,
    pub pages_requested: usize,
    pub termination: Termination,
}

impl From<&FetchOutcome> for CollectionSummary {
    fn from(outcome: &FetchOutcome) -> Self {
        Self {
            collection_id: outcome.collection_id.clone(),
            records: outcome.records.len(),
            pages_requested: outcome.pages_requested,
            termination: outcome.termination.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub collections: Vec<CollectionSummary>,
    pub fetched_records: usize,
    pub existing_records: usize,
    pub merged_records: usize,
    pub store: String,
    pub snapshot_path: String,
    pub dry_run: bool,
    pub uploaded_bytes: Option<usize>,
    pub snapshot_sha256: Option<String>,
    #[serde(skip)]
    pub snapshot: Vec<ParticipationRecord>,
}

impl SyncRunSummary {
    pub fn aborted_collections(&self) -> impl Iterator<Item = &CollectionSummary> {
        self.collections
            .iter()
            .filter(|c| matches!(c.termination, Termination::Aborted { .. }))
    }
}

#[derive(Debug)]
struct StoreStage {
    existing_records: usize,
    merged: Vec<ParticipationRecord>,
    receipt: Option<UploadReceipt>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    listing: Box<dyn ListingSource>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let listing = HttpListingSource::new(http, config.listing.clone());
        Ok(Self {
            config,
            listing: Box::new(listing),
        })
    }

    pub fn with_listing_source(mut self, listing: Box<dyn ListingSource>) -> Self {
        self.listing = listing;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetch every collection, one after another, without touching the store.
    pub async fn fetch(&self, collection_ids: &[CollectionId]) -> Vec<FetchOutcome> {
        PaginatedFetcher::new(self.listing.as_ref())
            .with_page_delay(self.config.page_delay)
            .fetch_collections(collection_ids)
            .await
    }

    pub async fn run_once(&self, collection_ids: &[CollectionId]) -> Result<SyncRunSummary, SyncError> {
        if collection_ids.is_empty() {
            return Err(SyncError::NoCollections);
        }

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, collections = collection_ids.len(), "sync run started");

        let outcomes = self.fetch(collection_ids).await;
        for outcome in outcomes.iter().filter(|o| o.is_aborted()) {
            warn!(
                collection = %outcome.collection_id,
                records = outcome.records.len(),
                "collection fetch aborted early"
            );
        }

        let incoming: Vec<ParticipationRecord> = outcomes
            .iter()
            .flat_map(|o| o.records.iter().cloned())
            .collect();
        if incoming.is_empty() {
            return Err(SyncError::NothingFetched {
                collections: collection_ids
                    .iter()
                    .map(CollectionId::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        let fetched_records = incoming.len();
        info!(%run_id, fetched_records, "fetch stage complete");

        let target = self.config.store.clone();
        let path = self.config.snapshot_path.clone();
        let dry_run = self.config.dry_run;
        let stage = tokio::task::spawn_blocking(move || {
            merge_into_store(&target, &path, &incoming, dry_run)
        })
        .await??;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            collections: outcomes.iter().map(CollectionSummary::from).collect(),
            fetched_records,
            existing_records: stage.existing_records,
            merged_records: stage.merged.len(),
            store: self.config.store.describe(),
            snapshot_path: self.config.snapshot_path.clone(),
            dry_run,
            uploaded_bytes: stage.receipt.as_ref().map(|r| r.byte_size),
            snapshot_sha256: stage.receipt.map(|r| r.content_hash),
            snapshot: stage.merged,
        };
        info!(
            %run_id,
            existing = summary.existing_records,
            merged = summary.merged_records,
            dry_run,
            "sync run finished"
        );
        Ok(summary)
    }

    /// The snapshot as it currently sits in the store.
    pub async fn current_snapshot(&self) -> Result<Vec<ParticipationRecord>, SyncError> {
        let target = self.config.store.clone();
        let path = self.config.snapshot_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut store = open_store(&target)?;
            let records = store.download(&path);
            close_store(store);
            Ok::<_, SyncError>(records)
        })
        .await?
    }
}

fn open_store(target: &StoreTarget) -> Result<SnapshotStore, SyncError> {
    SnapshotStore::open(target).map_err(|source| SyncError::StoreConnect {
        target: target.describe(),
        source,
    })
}

fn close_store(store: SnapshotStore) {
    if let Err(err) = store.close() {
        warn!(error = %err, "closing store session failed");
    }
}

/// Download, reconcile, upload over a single session. The session is closed
/// whether or not the upload succeeds.
fn merge_into_store(
    target: &StoreTarget,
    path: &str,
    incoming: &[ParticipationRecord],
    dry_run: bool,
) -> Result<StoreStage, SyncError> {
    let store = open_store(target)?;
    exchange_and_close(store, path, incoming, dry_run)
}

fn exchange_and_close(
    mut store: SnapshotStore,
    path: &str,
    incoming: &[ParticipationRecord],
    dry_run: bool,
) -> Result<StoreStage, SyncError> {
    let stage = exchange(&mut store, path, incoming, dry_run);
    close_store(store);
    stage
}

fn exchange(
    store: &mut SnapshotStore,
    path: &str,
    incoming: &[ParticipationRecord],
    dry_run: bool,
) -> Result<StoreStage, SyncError> {
    let existing = store.download(path);
    let merged = reconcile(&existing, incoming);
    info!(
        existing = existing.len(),
        incoming = incoming.len(),
        merged = merged.len(),
        "reconciled snapshot"
    );

    let receipt = if dry_run {
        info!(path, "dry run; skipping upload");
        None
    } else {
        Some(
            store
                .upload(path, &merged)
                .map_err(|source| SyncError::Upload {
                    path: path.to_string(),
                    source,
                })?,
        )
    };

    Ok(StoreStage {
        existing_records: existing.len(),
        merged,
        receipt,
    })
}

pub async fn run_sync_once_from_env(
    collection_ids: &[CollectionId],
) -> Result<SyncRunSummary, SyncError> {
    SyncPipeline::new(SyncConfig::from_env())?
        .run_once(collection_ids)
        .await
}
