//! Change feed reads.

use futures::stream::{self, Stream, TryStreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use super::state::IteratorState;
use crate::continuation::{ContinuationToken, RangeContinuation};
use crate::error::{ErrorCode, QueryError, QueryResult};
use crate::executor::RequestPipeline;
use crate::models::{ChangeFeedOptions, CollectionLink, Document, PartitionKeyRange, ResponseHeaders};
use crate::routing::{PartitionKeyRangeResolver, RoutingScope};
use crate::transport::{ChangeFeedStart, FeedKind, FeedRequest};

/// Reads the ordered changes of one range, one partition key, or a whole collection.
///
/// A change feed never ends: an empty block only means nothing changed since the
/// last poll, and the next call polls again. Each range keeps its own etag.
pub struct ChangeFeedCursor {
    collection: CollectionLink,
    options: ChangeFeedOptions,
    max_item_count: u32,
    pipeline: RequestPipeline,
    resolver: Arc<PartitionKeyRangeResolver>,
    scope: RoutingScope,
    initialized: bool,
    failed: Option<QueryError>,
    state: IteratorState,
    /// Range to poll first in the next block.
    next: usize,
    last_headers: Option<ResponseHeaders>,
    request_charge: f64,
}

impl ChangeFeedCursor {
    pub(crate) fn new(
        collection: CollectionLink,
        options: ChangeFeedOptions,
        max_item_count: u32,
        pipeline: RequestPipeline,
        resolver: Arc<PartitionKeyRangeResolver>,
    ) -> QueryResult<Self> {
        let scope = match (&options.partition_key_range_id, &options.partition_key) {
            (Some(_), Some(_)) => {
                return Err(QueryError::with_message(
                    ErrorCode::InvalidOptions,
                    "partition_key_range_id and partition_key are mutually exclusive",
                ))
            }
            (Some(id), None) => RoutingScope::RangeId(id.clone()),
            (None, Some(pk)) => RoutingScope::PartitionKey(pk.clone()),
            (None, None) => RoutingScope::All,
        };
        Ok(Self {
            collection,
            options,
            max_item_count,
            pipeline,
            resolver,
            scope,
            initialized: false,
            failed: None,
            state: IteratorState::default(),
            next: 0,
            last_headers: None,
            request_charge: 0.0,
        })
    }

    /// Returns the next block of at most `max_item_count` changes.
    ///
    /// Ranges are polled round-robin, each at most once per call, until the block
    /// is full. A call polls at least once unless changes left over from a failed
    /// call already fill the block.
    #[tracing::instrument(level = "debug", skip(self), fields(collection = %self.collection))]
    pub async fn fetch_next_block(&mut self) -> QueryResult<Vec<Document>> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        if !self.initialized {
            if let Err(e) = self.initialize().await {
                if e.is_configuration() {
                    self.failed = Some(e.clone());
                }
                return Err(e);
            }
        }

        let max = self.max_item_count as usize;
        let mut polled = 0;
        while self.state.ready.len() < max && polled < self.state.cursors.len() {
            let index = self.next % self.state.cursors.len();
            let want = max - self.state.ready.len();
            match self.poll(index, want).await? {
                Some(count) if count >= want => {
                    self.next = index;
                }
                Some(_) => {
                    self.next = index + 1;
                    polled += 1;
                }
                // Split: the successors now sit at `index`.
                None => self.next = index,
            }
        }

        Ok(self.state.take_block(max))
    }

    /// Streams changes until the first empty block.
    pub fn items(&mut self) -> impl Stream<Item = QueryResult<Document>> + '_ {
        stream::try_unfold(
            (self, VecDeque::<Document>::new()),
            |(cursor, mut buffer)| async move {
                if buffer.is_empty() {
                    buffer.extend(cursor.fetch_next_block().await?);
                }
                Ok::<_, QueryError>(buffer.pop_front().map(|item| (item, (cursor, buffer))))
            },
        )
    }

    /// Reads changes until the feed is caught up.
    pub async fn collect_items(&mut self) -> QueryResult<Vec<Document>> {
        self.items().try_collect().await
    }

    /// Headers of the most recent poll.
    pub fn response_headers(&self) -> Option<&ResponseHeaders> {
        self.last_headers.as_ref()
    }

    pub fn total_request_charge(&self) -> f64 {
        self.request_charge
    }

    /// Returns the position to resume from.
    ///
    /// A single-range cursor returns the range's raw etag; a cursor over several
    /// ranges returns an opaque token. Ranges never polled resume from the
    /// configured start.
    pub fn continuation(&self) -> QueryResult<Option<String>> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        if !self.initialized {
            return Ok(self.options.continuation.clone());
        }
        if !self.state.ready.is_empty() {
            return Err(QueryError::with_message(
                ErrorCode::InvalidOptions,
                "changes from a failed fetch are pending; fetch them before taking a continuation",
            ));
        }
        match self.state.cursors.as_slice() {
            [only] if self.scope != RoutingScope::All => Ok(only.continuation.clone()),
            cursors => ContinuationToken::Ranges(
                cursors
                    .iter()
                    .map(|c| RangeContinuation::new(&c.range, c.continuation.clone(), 0))
                    .collect(),
            )
            .encode(),
        }
    }

    async fn initialize(&mut self) -> QueryResult<()> {
        let token = match &self.options.continuation {
            Some(token) => ContinuationToken::decode(token)?,
            None => ContinuationToken::Start,
        };

        let mut state = IteratorState::default();
        match token {
            ContinuationToken::Start => {
                for range in self.resolve().await? {
                    state.add_cursor(range, None, 0);
                }
            }
            ContinuationToken::Etag(etag) => {
                if self.scope == RoutingScope::All {
                    return Err(QueryError::with_message(
                        ErrorCode::InvalidContinuation,
                        "an etag can only resume a single-range change feed",
                    ));
                }
                for range in self.resolve().await? {
                    state.add_cursor(range, Some(etag.clone()), 0);
                }
            }
            ContinuationToken::Ranges(points) => {
                let topology = self
                    .resolver
                    .resolve(&self.pipeline, &self.collection, &RoutingScope::All)
                    .await?;
                for point in points {
                    let range = topology.iter().find(|r| point.matches(r)).cloned().ok_or_else(|| {
                        QueryError::with_message(
                            ErrorCode::TopologyChanged,
                            format!("range '{}' from the continuation no longer exists", point.range_id),
                        )
                    })?;
                    if !self.scope.covers(&range) {
                        return Err(QueryError::with_message(
                            ErrorCode::InvalidContinuation,
                            format!("range '{}' from the continuation is outside this feed", range.id),
                        ));
                    }
                    state.add_cursor(range, point.token, 0);
                }
            }
        }

        debug!(ranges = state.cursors.len(), "change feed initialized");
        self.state = state;
        self.initialized = true;
        Ok(())
    }

    async fn resolve(&self) -> QueryResult<Vec<PartitionKeyRange>> {
        self.resolver
            .resolve(&self.pipeline, &self.collection, &self.scope)
            .await
    }

    /// Polls one range for up to `want` changes.
    ///
    /// Returns the number of changes received, or `None` when the range split and
    /// was replaced by its successors.
    async fn poll(&mut self, index: usize, want: usize) -> QueryResult<Option<usize>> {
        let cursor = &self.state.cursors[index];
        let start = match &cursor.continuation {
            Some(etag) => ChangeFeedStart::Etag(etag.clone()),
            None if self.options.is_start_from_beginning => ChangeFeedStart::Beginning,
            None => ChangeFeedStart::Now,
        };
        let request = FeedRequest {
            collection: self.collection.clone(),
            range_id: cursor.range.id.clone(),
            kind: FeedKind::ChangeFeed { start },
            max_item_count: want as u32,
            partition_key: self.options.partition_key.clone(),
        };

        let page = match self.pipeline.read_feed(request).await {
            Ok(page) => page,
            Err(e) if e.is_partition_split() => {
                let gone = self.state.cursors[index].range.clone();
                let successors = self
                    .resolver
                    .successors(&self.pipeline, &self.collection, &gone, &self.scope)
                    .await?;
                self.state.split(index, successors);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let count = page.items.len();
        trace!(range = %self.state.cursors[index].range.id, count, etag = ?page.headers.etag(), "change feed polled");
        self.state
            .advance_etag(index, page.headers.etag().map(str::to_string));
        self.state.ready.extend(page.items);
        self.request_charge += page.headers.request_charge();
        self.last_headers = Some(page.headers);
        Ok(Some(count))
    }
}
