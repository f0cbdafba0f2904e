//! In-memory partitioned collection service.
//!
//! Implements [`Transport`] for tests and the demo binary: collections are split
//! into partition key ranges by effective partition key, queries of the form
//! `SELECT * FROM c [WHERE c.x = v] [ORDER BY c.y [ASC|DESC]]` are served page by
//! page per range, and every write is appended to a per-collection change log.
//! Ranges can be split and failures injected while iterators are running.

mod collection;
mod query;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ErrorCode, QueryError, QueryResult};
use crate::models::{
    headers, CollectionLink, Document, Page, PartitionKey, PartitionKeyRange, QueryPlan,
    QueryRange, ResponseHeaders,
};
use crate::transport::{ChangeFeedStart, FeedKind, FeedRequest, Transport};

use collection::CollectionState;
pub use query::ParsedQuery;

/// Which calls an injected fault applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultTarget {
    Any,
    QueryPlan,
    PartitionKeyRanges,
    /// Any query page or change feed poll.
    ReadFeed,
    /// Reads of one partition key range.
    Range(String),
}

/// A failure returned instead of serving a call, a fixed number of times.
#[derive(Debug, Clone)]
struct Fault {
    code: ErrorCode,
    target: FaultTarget,
    retry_after: Option<Duration>,
    remaining: u32,
}

impl Fault {
    fn matches(&self, call: &Call<'_>) -> bool {
        match (&self.target, call) {
            (FaultTarget::Any, _) => true,
            (FaultTarget::QueryPlan, Call::QueryPlan) => true,
            (FaultTarget::PartitionKeyRanges, Call::PartitionKeyRanges) => true,
            (FaultTarget::ReadFeed, Call::ReadFeed(_)) => true,
            (FaultTarget::Range(id), Call::ReadFeed(range_id)) => id == range_id,
            _ => false,
        }
    }
}

enum Call<'a> {
    QueryPlan,
    PartitionKeyRanges,
    ReadFeed(&'a str),
}

type SharedCollection = Arc<RwLock<CollectionState>>;

/// In-memory service holding any number of partitioned collections.
#[derive(Default)]
pub struct Emulator {
    collections: DashMap<CollectionLink, SharedCollection>,
    faults: Mutex<Vec<Fault>>,
    served: AtomicU64,
}

impl Emulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collection with `range_count` equal partition key ranges.
    pub fn create_collection(
        &self,
        database: &str,
        collection: &str,
        partition_key_path: &str,
        range_count: u32,
    ) -> QueryResult<CollectionLink> {
        let link = CollectionLink::new(database, collection);
        if self.collections.contains_key(&link) {
            return Err(QueryError::with_message(
                ErrorCode::Conflict,
                format!("collection {} already exists", link),
            ));
        }
        let state = CollectionState::new(partition_key_path, range_count);
        info!(%link, ranges = state.ranges.len(), "collection created");
        self.collections.insert(link.clone(), Arc::new(RwLock::new(state)));
        Ok(link)
    }

    /// Creates a document. Fails with `Conflict` if the id exists under the same key.
    pub fn create_item(&self, link: &CollectionLink, document: Document) -> QueryResult<Document> {
        self.collection(link)?.write().write(document, false)
    }

    /// Creates or replaces a document. A replaced document moves to the end of the change feed.
    pub fn upsert_item(&self, link: &CollectionLink, document: Document) -> QueryResult<Document> {
        self.collection(link)?.write().write(document, true)
    }

    /// Splits a partition key range in two. Returns the ids of the new ranges.
    pub fn split_range(&self, link: &CollectionLink, range_id: &str) -> QueryResult<(String, String)> {
        let (left, right) = self.collection(link)?.write().split(range_id)?;
        info!(%link, range_id, %left, %right, "range split");
        Ok((left, right))
    }

    /// Returns the current ranges of a collection.
    pub fn ranges(&self, link: &CollectionLink) -> QueryResult<Vec<PartitionKeyRange>> {
        Ok(self.collection(link)?.read().ranges.clone())
    }

    /// Returns the id of the range that owns a partition key.
    pub fn range_for_partition_key(
        &self,
        link: &CollectionLink,
        partition_key: &PartitionKey,
    ) -> QueryResult<String> {
        let collection = self.collection(link)?;
        let state = collection.read();
        state
            .range_for(partition_key)
            .map(|r| r.id.clone())
            .ok_or_else(|| QueryError::new(ErrorCode::PartitionKeyRangeNotFound))
    }

    /// Fails the next `times` matching calls with `code`.
    pub fn inject_fault(&self, code: ErrorCode, target: FaultTarget, times: u32) {
        self.push_fault(code, target, None, times);
    }

    /// Like [`Emulator::inject_fault`], with a retry-after hint on each failure.
    pub fn inject_fault_with_retry_after(
        &self,
        code: ErrorCode,
        target: FaultTarget,
        retry_after: Duration,
        times: u32,
    ) {
        self.push_fault(code, target, Some(retry_after), times);
    }

    fn push_fault(&self, code: ErrorCode, target: FaultTarget, retry_after: Option<Duration>, times: u32) {
        if times == 0 {
            return;
        }
        self.faults.lock().push(Fault {
            code,
            target,
            retry_after,
            remaining: times,
        });
    }

    /// Drops every pending fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Number of calls received, failed ones included.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::SeqCst)
    }

    fn collection(&self, link: &CollectionLink) -> QueryResult<SharedCollection> {
        self.collections
            .get(link)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                QueryError::with_message(ErrorCode::NotFound, format!("collection {} not found", link))
            })
    }

    /// Counts the call and returns the first matching injected fault, if any.
    fn admit(&self, call: Call<'_>) -> QueryResult<()> {
        self.served.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults.lock();
        let Some(index) = faults.iter().position(|f| f.matches(&call)) else {
            return Ok(());
        };
        let fault = &mut faults[index];
        fault.remaining -= 1;
        let mut error = QueryError::new(fault.code).with_activity_id(Uuid::new_v4().to_string());
        if let Some(retry_after) = fault.retry_after {
            error = error.with_retry_after(retry_after);
        }
        if fault.remaining == 0 {
            faults.remove(index);
        }
        debug!(code = error.code.as_str(), "injected fault");
        Err(error)
    }

    fn query_page(
        &self,
        state: &CollectionState,
        request: &FeedRequest,
        text: &str,
        continuation: Option<&str>,
        populate_query_metrics: bool,
    ) -> QueryResult<Page> {
        let parsed = ParsedQuery::parse(text)?;
        let (items, continuation) = state.query_page(
            &request.range_id,
            &parsed,
            request.partition_key.as_ref(),
            continuation,
            request.max_item_count as usize,
        )?;

        let mut response = response_headers(state, &request.range_id, items.len())?;
        if let Some(token) = &continuation {
            response.insert(headers::CONTINUATION, token)?;
        }
        if populate_query_metrics {
            response.insert(
                headers::QUERY_METRICS,
                format!(
                    "totalExecutionTimeInMs=0.10;queryCompileTimeInMs=0.01;retrievedDocumentCount={};outputDocumentCount={};indexHitRatio=1.00",
                    state.documents.len(),
                    items.len()
                ),
            )?;
        }
        Ok(Page::new(items, continuation, response))
    }

    fn change_feed_page(
        &self,
        state: &CollectionState,
        request: &FeedRequest,
        start: &ChangeFeedStart,
    ) -> QueryResult<Page> {
        let from = match start {
            ChangeFeedStart::Now => state.lsn,
            ChangeFeedStart::Beginning => 0,
            ChangeFeedStart::Etag(etag) => parse_etag(etag)?,
        };
        let (items, position) = state.change_feed_page(
            &request.range_id,
            request.partition_key.as_ref(),
            from,
            request.max_item_count as usize,
        )?;

        let etag = format!("\"{}\"", position);
        let mut response = response_headers(state, &request.range_id, items.len())?;
        response.insert("etag", &etag)?;
        response.insert(headers::CONTINUATION, &etag)?;
        Ok(Page::new(items, Some(etag), response))
    }
}

fn response_headers(
    state: &CollectionState,
    range_id: &str,
    item_count: usize,
) -> QueryResult<ResponseHeaders> {
    let mut response = ResponseHeaders::new();
    response.insert(headers::ACTIVITY_ID, Uuid::new_v4().to_string())?;
    response.insert(
        headers::REQUEST_CHARGE,
        format!("{:.2}", 2.0 + 0.5 * item_count as f64),
    )?;
    response.insert(headers::ITEM_COUNT, item_count.to_string())?;
    response.insert(headers::SESSION_TOKEN, format!("{}:{}", range_id, state.lsn))?;
    response.insert(headers::PARTITION_KEY_RANGE_ID, range_id)?;
    Ok(response)
}

fn parse_etag(etag: &str) -> QueryResult<u64> {
    etag.trim_matches('"').parse().map_err(|_| {
        QueryError::with_message(ErrorCode::BadRequest, format!("malformed etag: {}", etag))
    })
}

#[async_trait]
impl Transport for Emulator {
    async fn query_plan(&self, collection: &CollectionLink, query: &str) -> QueryResult<QueryPlan> {
        self.admit(Call::QueryPlan)?;
        let shared = self.collection(collection)?;
        let state = shared.read();
        let parsed = ParsedQuery::parse(query)?;

        let query_ranges = match &parsed.filter {
            Some((path, value)) if *path == state.partition_key_path => {
                let key = PartitionKey::new(value.clone())?;
                vec![QueryRange::point(key.effective_partition_key())]
            }
            _ => Vec::new(),
        };
        Ok(QueryPlan {
            order_by: parsed.order_by,
            query_ranges,
            rewritten_query: None,
        })
    }

    async fn partition_key_ranges(
        &self,
        collection: &CollectionLink,
    ) -> QueryResult<Vec<PartitionKeyRange>> {
        self.admit(Call::PartitionKeyRanges)?;
        Ok(self.collection(collection)?.read().ranges.clone())
    }

    async fn read_feed(&self, request: &FeedRequest) -> QueryResult<Page> {
        self.admit(Call::ReadFeed(&request.range_id))?;
        let shared = self.collection(&request.collection)?;
        let state = shared.read();
        match &request.kind {
            FeedKind::Query {
                text,
                continuation,
                populate_query_metrics,
            } => self.query_page(
                &state,
                request,
                text,
                continuation.as_deref(),
                *populate_query_metrics,
            ),
            FeedKind::ChangeFeed { start } => self.change_feed_page(&state, request, start),
        }
    }
}
