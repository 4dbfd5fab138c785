//! Listing API contract and the paginated participant fetcher.

use std::time::Duration;

use async_trait::async_trait;
use roster_core::{normalize_identifier, CollectionId, ParticipationRecord, RawIdentifier};
use roster_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "roster-adapters";

/// Default pause between page requests.
pub const DEFAULT_PAGE_DELAY: Duration = Duration::from_millis(500);

/// One page of the listing API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingPage {
    #[serde(default)]
    pub list: Option<Vec<ListingItem>>,
    #[serde(default)]
    pub next_page: Option<RawIdentifier>,
}

/// Listing entry. The participant id sits at the top level; the event id is
/// usually only present inside the nested association object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingItem {
    #[serde(default, alias = "room_id")]
    pub participant_id: Option<RawIdentifier>,
    #[serde(default)]
    pub event_id: Option<RawIdentifier>,
    #[serde(default, alias = "event_entry")]
    pub association: Option<Association>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Association {
    #[serde(default, alias = "room_id")]
    pub participant_id: Option<RawIdentifier>,
    #[serde(default)]
    pub event_id: Option<RawIdentifier>,
}

impl ListingPage {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ListingError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Next page number, if the response names one.
    pub fn next_cursor(&self) -> Option<u64> {
        normalize_identifier(self.next_page.as_ref()).and_then(|s| s.parse().ok())
    }
}

impl ListingItem {
    /// Top-level identifiers win over the nested copies. Items missing either
    /// identifier yield nothing.
    pub fn to_record(&self) -> Option<ParticipationRecord> {
        let nested = self.association.as_ref();
        let participant_id = normalize_identifier(self.participant_id.as_ref())
            .or_else(|| normalize_identifier(nested.and_then(|a| a.participant_id.as_ref())))?;
        let event_id = normalize_identifier(self.event_id.as_ref())
            .or_else(|| normalize_identifier(nested.and_then(|a| a.event_id.as_ref())))?;
        Some(ParticipationRecord {
            participant_id,
            event_id,
        })
    }
}

#[derive(Debug, Error)]
pub enum ListingError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed listing body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_page(
        &self,
        collection_id: &CollectionId,
        page: u64,
    ) -> Result<ListingPage, ListingError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEndpoint {
    pub url: String,
    pub collection_param: String,
    pub page_param: String,
}

#[derive(Debug, Clone)]
pub struct HttpListingSource {
    http: HttpFetcher,
    endpoint: ListingEndpoint,
}

impl HttpListingSource {
    pub fn new(http: HttpFetcher, endpoint: ListingEndpoint) -> Self {
        Self { http, endpoint }
    }
}

#[async_trait]
impl ListingSource for HttpListingSource {
    async fn fetch_page(
        &self,
        collection_id: &CollectionId,
        page: u64,
    ) -> Result<ListingPage, ListingError> {
        let page = page.to_string();
        let query = [
            (self.endpoint.collection_param.as_str(), collection_id.as_str()),
            (self.endpoint.page_param.as_str(), page.as_str()),
        ];
        let response = self.http.fetch_bytes(&self.endpoint.url, &query).await?;
        ListingPage::from_json_bytes(&response.body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Termination {
    /// Empty page, missing cursor, or a cursor pointing at the current page.
    Exhausted,
    /// A request failed; records from earlier pages are kept.
    Aborted { page: u64, reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub collection_id: CollectionId,
    pub records: Vec<ParticipationRecord>,
    pub pages_requested: usize,
    pub termination: Termination,
}

impl FetchOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self.termination, Termination::Aborted { .. })
    }
}

pub struct PaginatedFetcher<'a> {
    source: &'a dyn ListingSource,
    page_delay: Duration,
}

impl<'a> PaginatedFetcher<'a> {
    pub fn new(source: &'a dyn ListingSource) -> Self {
        Self {
            source,
            page_delay: DEFAULT_PAGE_DELAY,
        }
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// Walk every page of one collection, starting at page 1.
    pub async fn fetch_all(&self, collection_id: &CollectionId) -> FetchOutcome {
        let span = info_span!("fetch_collection", collection = %collection_id);
        async move {
            let mut page = 1u64;
            let mut pages_requested = 0usize;
            let mut records = Vec::new();

            let termination = loop {
                pages_requested += 1;
                let listing = match self.source.fetch_page(collection_id, page).await {
                    Ok(listing) => listing,
                    Err(err) => {
                        warn!(page, error = %err, "listing request failed; keeping earlier pages");
                        break Termination::Aborted {
                            page,
                            reason: err.to_string(),
                        };
                    }
                };

                let next = listing.next_cursor();
                let items = listing.list.unwrap_or_default();
                if items.is_empty() {
                    info!(page, "empty page; listing exhausted");
                    break Termination::Exhausted;
                }

                let before = records.len();
                records.extend(items.iter().filter_map(ListingItem::to_record));
                let kept = records.len() - before;
                info!(
                    page,
                    items = items.len(),
                    kept,
                    skipped = items.len() - kept,
                    next_page = ?next,
                    "page processed"
                );

                match next {
                    Some(next) if next != page => page = next,
                    _ => break Termination::Exhausted,
                }

                if !self.page_delay.is_zero() {
                    tokio::time::sleep(self.page_delay).await;
                }
            };

            info!(records = records.len(), pages_requested, "collection fetched");
            FetchOutcome {
                collection_id: collection_id.clone(),
                records,
                pages_requested,
                termination,
            }
        }
        .instrument(span)
        .await
    }

    /// Fetch each collection in turn. Outcomes keep input order.
    pub async fn fetch_collections(&self, collection_ids: &[CollectionId]) -> Vec<FetchOutcome> {
        let mut outcomes = Vec::with_capacity(collection_ids.len());
        for collection_id in collection_ids {
            outcomes.push(self.fetch_all(collection_id).await);
        }
        outcomes
    }
}
