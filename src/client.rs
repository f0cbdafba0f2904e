//! Entry point for queries and change feed reads.

use std::sync::Arc;
use tracing::debug;

use crate::config::{ClientConfig, RetryPolicy};
use crate::error::QueryResult;
use crate::executor::{RequestExecutor, RequestPipeline, RetryingExecutor};
use crate::models::{
    resolve_max_item_count, ChangeFeedOptions, CollectionLink, QueryOptions,
};
use crate::query::{ChangeFeedCursor, QueryIterator};
use crate::routing::PartitionKeyRangeResolver;
use crate::transport::Transport;

/// Client for paged reads against a partitioned collection.
///
/// Iterators created by one client share its executor and its cache of
/// partition key ranges; each iterator owns its own pagination state.
pub struct FeedClient {
    config: Arc<ClientConfig>,
    pipeline: RequestPipeline,
    resolver: Arc<PartitionKeyRangeResolver>,
}

impl FeedClient {
    /// Creates a client with the default configuration and a retrying executor.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        FeedClientBuilder::new(transport).build()
    }

    pub fn builder(transport: Arc<dyn Transport>) -> FeedClientBuilder {
        FeedClientBuilder::new(transport)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The partition key range cache shared by this client's iterators.
    pub fn resolver(&self) -> &PartitionKeyRangeResolver {
        &self.resolver
    }

    /// Creates a lazy query iterator. No request is sent until the first fetch.
    ///
    /// `collection_link` may carry leading and trailing slashes.
    pub fn query_items(
        &self,
        collection_link: &str,
        query: impl Into<String>,
        options: QueryOptions,
    ) -> QueryResult<QueryIterator> {
        let collection = CollectionLink::parse(collection_link)?;
        let max_item_count =
            resolve_max_item_count(options.max_item_count, self.config.default_max_item_count)?;
        let query = query.into();
        debug!(%collection, %query, max_item_count, "query created");

        Ok(QueryIterator::new(
            collection,
            query,
            options,
            max_item_count,
            self.config.max_concurrent_requests,
            self.pipeline.clone(),
            self.resolver.clone(),
        ))
    }

    /// Creates a change feed cursor. No request is sent until the first fetch.
    pub fn query_items_change_feed(
        &self,
        collection_link: &str,
        options: ChangeFeedOptions,
    ) -> QueryResult<ChangeFeedCursor> {
        let collection = CollectionLink::parse(collection_link)?;
        let max_item_count =
            resolve_max_item_count(options.max_item_count, self.config.default_max_item_count)?;
        debug!(%collection, max_item_count, "change feed created");

        ChangeFeedCursor::new(
            collection,
            options,
            max_item_count,
            self.pipeline.clone(),
            self.resolver.clone(),
        )
    }
}

/// Builder for a [`FeedClient`].
pub struct FeedClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    executor: Option<Arc<dyn RequestExecutor>>,
}

impl FeedClientBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
            executor: None,
        }
    }

    /// Sets the configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the retry policy of the default executor.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn default_max_item_count(mut self, max_item_count: u32) -> Self {
        self.config.default_max_item_count = max_item_count;
        self
    }

    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.config.max_concurrent_requests = max;
        self
    }

    /// Replaces the default retrying executor.
    pub fn executor(mut self, executor: Arc<dyn RequestExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Builds the client.
    pub fn build(self) -> FeedClient {
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(RetryingExecutor::new(self.config.retry.clone())));

        FeedClient {
            pipeline: RequestPipeline::new(self.transport, executor),
            resolver: Arc::new(PartitionKeyRangeResolver::new()),
            config: Arc::new(self.config),
        }
    }
}
