//! Cross-partition query iteration.

use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use super::state::{IteratorState, Phase};
use crate::continuation::ContinuationToken;
use crate::error::{ErrorCode, QueryError, QueryResult};
use crate::executor::RequestPipeline;
use crate::models::{
    CollectionLink, Document, OrderByItem, Page, PartitionKeyRange, QueryOptions, QueryPlan,
    ResponseHeaders,
};
use crate::routing::{PartitionKeyRangeResolver, RoutingScope};
use crate::transport::{FeedKind, FeedRequest};

/// Outcome of one per-range read within a fan-out.
enum Fetched {
    Page(Page),
    Gone,
}

/// Lazily executes a query across the partition key ranges it touches.
///
/// Nothing is sent until the first [`QueryIterator::fetch_next_block`]. Ordered
/// cross-partition queries are merged with a k-way merge that keeps one buffered
/// head per range; unordered queries drain ranges one after another.
pub struct QueryIterator {
    collection: CollectionLink,
    query: String,
    options: QueryOptions,
    max_item_count: u32,
    max_concurrent_requests: usize,
    pipeline: RequestPipeline,
    resolver: Arc<PartitionKeyRangeResolver>,
    phase: Phase,
    state: IteratorState,
    plan: QueryPlan,
    order_by: Option<Arc<[OrderByItem]>>,
    scope: RoutingScope,
    last_headers: Option<ResponseHeaders>,
    request_charge: f64,
}

impl QueryIterator {
    pub(crate) fn new(
        collection: CollectionLink,
        query: String,
        options: QueryOptions,
        max_item_count: u32,
        max_concurrent_requests: usize,
        pipeline: RequestPipeline,
        resolver: Arc<PartitionKeyRangeResolver>,
    ) -> Self {
        Self {
            collection,
            query,
            options,
            max_item_count,
            max_concurrent_requests: max_concurrent_requests.max(1),
            pipeline,
            resolver,
            phase: Phase::Created,
            state: IteratorState::default(),
            plan: QueryPlan::default(),
            order_by: None,
            scope: RoutingScope::All,
            last_headers: None,
            request_charge: 0.0,
        }
    }

    /// Returns the next block of at most `max_item_count` items.
    ///
    /// An empty block means the query is exhausted; later calls keep returning
    /// empty blocks without issuing requests. A failed call can be retried:
    /// items merged before the failure are returned by the next successful call.
    #[tracing::instrument(level = "debug", skip(self), fields(collection = %self.collection))]
    pub async fn fetch_next_block(&mut self) -> QueryResult<Vec<Document>> {
        match &self.phase {
            Phase::Failed(e) => return Err(e.clone()),
            Phase::Exhausted => return Ok(Vec::new()),
            Phase::Created | Phase::Active => {}
        }
        if matches!(self.phase, Phase::Created) {
            let initialized = self.initialize().await;
            self.check(initialized)?;
        }

        let max = self.max_item_count as usize;
        let filled = match self.order_by.clone() {
            Some(order_by) => self.fill_ordered(max, &order_by).await,
            None => self.fill_unordered(max).await,
        };
        self.check(filled)?;

        let block = self.state.take_block(max);
        if self.state.is_drained() {
            debug!("query exhausted");
            self.phase = Phase::Exhausted;
        }
        Ok(block)
    }

    /// Streams items one at a time, fetching blocks as needed.
    ///
    /// The stream ends at the first empty block and cannot be restarted.
    pub fn items(&mut self) -> impl Stream<Item = QueryResult<Document>> + '_ {
        stream::try_unfold(
            (self, VecDeque::<Document>::new()),
            |(iter, mut buffer)| async move {
                if buffer.is_empty() {
                    buffer.extend(iter.fetch_next_block().await?);
                }
                Ok::<_, QueryError>(buffer.pop_front().map(|item| (item, (iter, buffer))))
            },
        )
    }

    /// Reads every remaining item.
    pub async fn collect_items(&mut self) -> QueryResult<Vec<Document>> {
        self.items().try_collect().await
    }

    /// Headers of the most recent response; replaced by every fetch.
    pub fn response_headers(&self) -> Option<&ResponseHeaders> {
        self.last_headers.as_ref()
    }

    /// Sum of request charges of every response seen so far.
    pub fn total_request_charge(&self) -> f64 {
        self.request_charge
    }

    /// Returns whether the iterator is exhausted.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.phase, Phase::Exhausted)
    }

    /// Returns an opaque token that resumes this query where it stands, or `None`
    /// once it is exhausted.
    pub fn continuation(&self) -> QueryResult<Option<String>> {
        match &self.phase {
            Phase::Created => Ok(self.options.continuation.clone()),
            Phase::Exhausted => Ok(None),
            Phase::Failed(e) => Err(e.clone()),
            Phase::Active => {
                if !self.state.ready.is_empty() {
                    return Err(QueryError::with_message(
                        ErrorCode::InvalidOptions,
                        "items from a failed fetch are pending; fetch them before taking a continuation",
                    ));
                }
                let points = self.state.resume_points();
                if points.is_empty() {
                    return Ok(None);
                }
                ContinuationToken::Ranges(points).encode()
            }
        }
    }

    /// Makes configuration errors sticky.
    fn check(&mut self, result: QueryResult<()>) -> QueryResult<()> {
        if let Err(e) = &result {
            if e.is_configuration() {
                self.phase = Phase::Failed(e.clone());
            }
        }
        result
    }

    async fn initialize(&mut self) -> QueryResult<()> {
        // Any query without a partition key gets a plan: a single range can still
        // split into several mid-iteration.
        let (scope, plan) = match &self.options.partition_key {
            Some(pk) => (RoutingScope::PartitionKey(pk.clone()), QueryPlan::default()),
            None => {
                let plan = self.pipeline.query_plan(&self.collection, &self.query).await?;
                let scope = if plan.query_ranges.is_empty() {
                    RoutingScope::All
                } else {
                    RoutingScope::QueryRanges(plan.query_ranges.clone())
                };
                (scope, plan)
            }
        };

        let ranges = self
            .resolver
            .resolve(&self.pipeline, &self.collection, &scope)
            .await?;

        if self.options.partition_key.is_none()
            && !self.options.enable_cross_partition_query
            && ranges.len() > 1
        {
            return Err(QueryError::new(ErrorCode::CrossPartitionQueryDisabled));
        }

        let mut state = IteratorState::default();
        let token = match &self.options.continuation {
            Some(token) => ContinuationToken::decode(token)?,
            None => ContinuationToken::Start,
        };
        match token {
            ContinuationToken::Start => {
                for range in ranges {
                    state.add_cursor(range, None, 0);
                }
            }
            ContinuationToken::Etag(_) => {
                return Err(QueryError::with_message(
                    ErrorCode::InvalidContinuation,
                    "query continuations must come from QueryIterator::continuation",
                ));
            }
            ContinuationToken::Ranges(points) => {
                for point in points {
                    let range = ranges.iter().find(|r| point.matches(r)).cloned().ok_or_else(|| {
                        QueryError::with_message(
                            ErrorCode::TopologyChanged,
                            format!("range '{}' from the continuation no longer exists", point.range_id),
                        )
                    })?;
                    state.add_cursor(range, point.token, point.skip);
                }
            }
        }

        debug!(
            ranges = state.cursors.len(),
            ordered = plan.is_ordered(),
            "query initialized"
        );
        self.order_by = plan.is_ordered().then(|| plan.order_by.clone().into());
        self.plan = plan;
        self.scope = scope;
        self.state = state;
        self.phase = Phase::Active;
        Ok(())
    }

    /// Fills the ready buffer by draining ranges in order.
    async fn fill_unordered(&mut self, max: usize) -> QueryResult<()> {
        while self.state.ready.len() < max {
            let Some(index) = self.state.cursors.iter().position(|c| !c.is_drained()) else {
                break;
            };
            if self.state.cursors[index].buffer.is_empty() {
                self.refill(vec![index]).await?;
            } else {
                let limit = max - self.state.ready.len();
                self.state.drain_front(index, limit);
            }
        }
        Ok(())
    }

    /// Fills the ready buffer with a k-way merge over the ranges' head items.
    async fn fill_ordered(&mut self, max: usize, order_by: &Arc<[OrderByItem]>) -> QueryResult<()> {
        while self.state.ready.len() < max {
            let empty: Vec<usize> = self
                .state
                .cursors
                .iter()
                .enumerate()
                .filter(|(_, c)| c.needs_page())
                .map(|(i, _)| i)
                .collect();

            if !empty.is_empty() {
                self.refill(empty).await?;
                continue;
            }

            if !self.state.merge_step(order_by) {
                break;
            }
        }
        Ok(())
    }

    /// Fetches the next page of each listed cursor, concurrently.
    ///
    /// Nothing is applied unless every read succeeds or reports a split.
    async fn refill(&mut self, indices: Vec<usize>) -> QueryResult<()> {
        let requests: Vec<(u64, FeedRequest)> = indices
            .iter()
            .map(|&i| {
                let cursor = &self.state.cursors[i];
                (cursor.id, self.feed_request(&cursor.range, cursor.continuation.clone()))
            })
            .collect();
        trace!(count = requests.len(), "fetching range pages");

        let pipeline = &self.pipeline;
        let fetched: Vec<(u64, Fetched)> = stream::iter(requests)
            .map(|(id, request)| async move {
                match pipeline.read_feed(request).await {
                    Ok(page) => Ok((id, Fetched::Page(page))),
                    Err(e) if e.is_partition_split() => Ok((id, Fetched::Gone)),
                    Err(e) => Err(e),
                }
            })
            .buffered(self.max_concurrent_requests)
            .try_collect()
            .await?;

        for (id, outcome) in fetched {
            let Some(index) = self.state.position(id) else {
                continue;
            };
            match outcome {
                Fetched::Page(page) => {
                    let Page {
                        items,
                        continuation,
                        headers,
                    } = page;
                    trace!(range = %self.state.cursors[index].range.id, items = items.len(), "page received");
                    self.record(headers);
                    self.state.cursors[index].apply_page(items, continuation);
                    if let Some(order_by) = &self.order_by {
                        self.state.push_head(index, order_by);
                    }
                }
                Fetched::Gone => self.replace_gone(index).await?,
            }
        }
        Ok(())
    }

    async fn replace_gone(&mut self, index: usize) -> QueryResult<()> {
        let cursor = &self.state.cursors[index];
        if cursor.skip > 0 {
            return Err(QueryError::with_message(
                ErrorCode::TopologyChanged,
                format!("range '{}' split before a resumed page could be replayed", cursor.range.id),
            ));
        }
        let gone: PartitionKeyRange = cursor.range.clone();
        let successors = self
            .resolver
            .successors(&self.pipeline, &self.collection, &gone, &self.scope)
            .await?;
        self.state.split(index, successors);
        Ok(())
    }

    fn feed_request(&self, range: &PartitionKeyRange, continuation: Option<String>) -> FeedRequest {
        let text = self
            .plan
            .rewritten_query
            .clone()
            .unwrap_or_else(|| self.query.clone());
        FeedRequest {
            collection: self.collection.clone(),
            range_id: range.id.clone(),
            kind: FeedKind::Query {
                text,
                continuation,
                populate_query_metrics: self.options.populate_query_metrics,
            },
            max_item_count: self.max_item_count,
            partition_key: self.options.partition_key.clone(),
        }
    }

    fn record(&mut self, headers: ResponseHeaders) {
        self.request_charge += headers.request_charge();
        self.last_headers = Some(headers);
    }
}
