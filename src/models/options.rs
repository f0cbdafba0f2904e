//! Query and change feed request options.

use super::PartitionKey;
use crate::error::{ErrorCode, QueryError, QueryResult};

/// Options for a query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Routes the query to the single range owning this key.
    pub partition_key: Option<PartitionKey>,
    /// Required when no partition key is given and the collection has several ranges.
    pub enable_cross_partition_query: bool,
    /// Page size hint. Falls back to the client default.
    pub max_item_count: Option<u32>,
    /// Ask the service to attach query metrics to every response.
    pub populate_query_metrics: bool,
    /// Token returned by a previous iterator's `continuation()`.
    pub continuation: Option<String>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_key(mut self, partition_key: impl Into<PartitionKey>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn enable_cross_partition_query(mut self, enabled: bool) -> Self {
        self.enable_cross_partition_query = enabled;
        self
    }

    pub fn max_item_count(mut self, max_item_count: u32) -> Self {
        self.max_item_count = Some(max_item_count);
        self
    }

    pub fn populate_query_metrics(mut self, enabled: bool) -> Self {
        self.populate_query_metrics = enabled;
        self
    }

    pub fn continuation(mut self, continuation: impl Into<String>) -> Self {
        self.continuation = Some(continuation.into());
        self
    }
}

/// Options for a change feed read.
#[derive(Debug, Clone, Default)]
pub struct ChangeFeedOptions {
    /// Restricts the feed to one partition key range.
    pub partition_key_range_id: Option<String>,
    /// Restricts the feed to the changes of one partition key.
    pub partition_key: Option<PartitionKey>,
    /// Start at the earliest retained change instead of "now".
    pub is_start_from_beginning: bool,
    /// Etag or token to resume from; wins over `is_start_from_beginning`.
    pub continuation: Option<String>,
    /// Page size hint. Falls back to the client default.
    pub max_item_count: Option<u32>,
}

impl ChangeFeedOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_key_range_id(mut self, id: impl Into<String>) -> Self {
        self.partition_key_range_id = Some(id.into());
        self
    }

    pub fn partition_key(mut self, partition_key: impl Into<PartitionKey>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn start_from_beginning(mut self, enabled: bool) -> Self {
        self.is_start_from_beginning = enabled;
        self
    }

    pub fn continuation(mut self, continuation: impl Into<String>) -> Self {
        self.continuation = Some(continuation.into());
        self
    }

    pub fn max_item_count(mut self, max_item_count: u32) -> Self {
        self.max_item_count = Some(max_item_count);
        self
    }
}

/// Resolves the page size hint, rejecting zero.
pub(crate) fn resolve_max_item_count(requested: Option<u32>, default: u32) -> QueryResult<u32> {
    match requested {
        Some(0) => Err(QueryError::with_message(
            ErrorCode::InvalidOptions,
            "max_item_count must be at least 1",
        )),
        Some(n) => Ok(n),
        None => Ok(default.max(1)),
    }
}
