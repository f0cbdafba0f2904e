//! The network boundary consumed by the query core.

use async_trait::async_trait;

use crate::error::QueryResult;
use crate::models::{CollectionLink, Page, PartitionKey, PartitionKeyRange, QueryPlan};

/// Where a change feed read starts within a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFeedStart {
    /// Only changes made after this request.
    Now,
    /// The earliest retained change.
    Beginning,
    /// Changes after the given etag.
    Etag(String),
}

/// What a feed request reads.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedKind {
    Query {
        text: String,
        continuation: Option<String>,
        populate_query_metrics: bool,
    },
    ChangeFeed {
        start: ChangeFeedStart,
    },
}

/// A single-range read: one query page or one change feed poll.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRequest {
    pub collection: CollectionLink,
    pub range_id: String,
    pub kind: FeedKind,
    pub max_item_count: u32,
    /// Restricts results to documents with this partition key.
    pub partition_key: Option<PartitionKey>,
}

impl FeedRequest {
    pub fn is_change_feed(&self) -> bool {
        matches!(self.kind, FeedKind::ChangeFeed { .. })
    }
}

/// Raw request/response transport to the database service.
///
/// Implementations must be safe to call concurrently; the core fans out
/// per-range reads in parallel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches the logical plan for a cross-partition query.
    async fn query_plan(&self, collection: &CollectionLink, query: &str) -> QueryResult<QueryPlan>;

    /// Lists the collection's current partition key ranges.
    async fn partition_key_ranges(
        &self,
        collection: &CollectionLink,
    ) -> QueryResult<Vec<PartitionKeyRange>>;

    /// Reads one page from one range.
    async fn read_feed(&self, request: &FeedRequest) -> QueryResult<Page>;
}
