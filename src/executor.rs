//! Request execution with retries.
//!
//! Every network call the core makes is described as an [`Operation`] and sent
//! through a [`RequestExecutor`]. Executors compose: [`RetryingExecutor`] wraps a
//! per-attempt executor, and [`CountingExecutor`] counts the calls of whatever it
//! wraps, so tests can observe either logical requests or individual attempts.

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{ErrorCode, QueryError, QueryResult};
use crate::models::{headers, CollectionLink, Page, PartitionKeyRange, QueryPlan};
use crate::transport::{FeedRequest, Transport};

/// A single network call.
#[derive(Debug, Clone)]
pub enum Operation {
    QueryPlan {
        collection: CollectionLink,
        query: String,
    },
    PartitionKeyRanges {
        collection: CollectionLink,
    },
    ReadFeed(FeedRequest),
}

impl Operation {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::QueryPlan { .. } => "query_plan",
            Operation::PartitionKeyRanges { .. } => "pkranges",
            Operation::ReadFeed(request) if request.is_change_feed() => "change_feed",
            Operation::ReadFeed(_) => "query",
        }
    }

    /// Issues the operation once against the transport.
    pub async fn dispatch(&self, transport: &dyn Transport) -> QueryResult<Response> {
        match self {
            Operation::QueryPlan { collection, query } => transport
                .query_plan(collection, query)
                .await
                .map(Response::QueryPlan),
            Operation::PartitionKeyRanges { collection } => transport
                .partition_key_ranges(collection)
                .await
                .map(Response::PartitionKeyRanges),
            Operation::ReadFeed(request) => transport.read_feed(request).await.map(Response::Page),
        }
    }
}

/// Result of an [`Operation`].
#[derive(Debug, Clone)]
pub enum Response {
    QueryPlan(QueryPlan),
    PartitionKeyRanges(Vec<PartitionKeyRange>),
    Page(Page),
}

/// Executes operations against a transport.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, transport: &dyn Transport, operation: &Operation) -> QueryResult<Response>;
}

#[async_trait]
impl<E: RequestExecutor + ?Sized> RequestExecutor for Arc<E> {
    async fn execute(&self, transport: &dyn Transport, operation: &Operation) -> QueryResult<Response> {
        (**self).execute(transport, operation).await
    }
}

/// Issues each operation exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

#[async_trait]
impl RequestExecutor for DirectExecutor {
    async fn execute(&self, transport: &dyn Transport, operation: &Operation) -> QueryResult<Response> {
        operation.dispatch(transport).await
    }
}

/// Retries transient failures with capped exponential backoff.
///
/// Partition split signals are returned as-is; re-resolving ranges is the
/// iterator's job.
pub struct RetryingExecutor<E = DirectExecutor> {
    policy: RetryPolicy,
    inner: E,
    attempts: AtomicU64,
}

impl RetryingExecutor<DirectExecutor> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_inner(policy, DirectExecutor)
    }
}

impl<E: RequestExecutor> RetryingExecutor<E> {
    /// Creates a retrying executor whose attempts go through `inner`.
    pub fn with_inner(policy: RetryPolicy, inner: E) -> Self {
        Self {
            policy,
            inner,
            attempts: AtomicU64::new(0),
        }
    }

    /// Total attempts issued so far, retries included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn delay_for(&self, error: &QueryError, retry: u32) -> Duration {
        if let Some(retry_after) = error.retry_after {
            return retry_after;
        }
        jittered(self.policy.backoff(retry))
    }
}

#[async_trait]
impl<E: RequestExecutor> RequestExecutor for RetryingExecutor<E> {
    #[tracing::instrument(level = "debug", skip_all, fields(op = operation.name()))]
    async fn execute(&self, transport: &dyn Transport, operation: &Operation) -> QueryResult<Response> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.attempts.fetch_add(1, Ordering::SeqCst);

            match self.inner.execute(transport, operation).await {
                Ok(mut response) => {
                    if let Response::Page(page) = &mut response {
                        page.headers
                            .insert(headers::THROTTLE_RETRY_COUNT, (attempt - 1).to_string())?;
                    }
                    return Ok(response);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(&e, attempt);
                    warn!(
                        attempt,
                        code = e.code.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!(attempt, code = e.code.as_str(), "retries exhausted");
                    let mut exhausted = QueryError::with_message(
                        ErrorCode::RetriesExhausted,
                        format!("{} after {} attempts: {}", operation.name(), attempt, e.message),
                    );
                    exhausted.activity_id = e.activity_id;
                    return Err(exhausted);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Adds up to 25% random jitter.
fn jittered(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() / 4) as u64;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

/// Counts every call made through it before delegating.
pub struct CountingExecutor<E> {
    inner: E,
    calls: Arc<AtomicU64>,
}

impl<E: RequestExecutor> CountingExecutor<E> {
    pub fn new(inner: E) -> Self {
        Self::with_counter(inner, Arc::new(AtomicU64::new(0)))
    }

    /// Shares `calls` with other counters, so stacked decorators add up.
    pub fn with_counter(inner: E, calls: Arc<AtomicU64>) -> Self {
        Self { inner, calls }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        self.calls.clone()
    }

    pub fn reset(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl<E: RequestExecutor> RequestExecutor for CountingExecutor<E> {
    async fn execute(&self, transport: &dyn Transport, operation: &Operation) -> QueryResult<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(transport, operation).await
    }
}

/// Typed access to the executor for the iterator and resolver.
#[derive(Clone)]
pub(crate) struct RequestPipeline {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn RequestExecutor>,
}

impl RequestPipeline {
    pub(crate) fn new(transport: Arc<dyn Transport>, executor: Arc<dyn RequestExecutor>) -> Self {
        Self { transport, executor }
    }

    pub(crate) async fn query_plan(
        &self,
        collection: &CollectionLink,
        query: &str,
    ) -> QueryResult<QueryPlan> {
        let operation = Operation::QueryPlan {
            collection: collection.clone(),
            query: query.to_string(),
        };
        match self.executor.execute(self.transport.as_ref(), &operation).await? {
            Response::QueryPlan(plan) => Ok(plan),
            other => Err(unexpected(&operation, &other)),
        }
    }

    pub(crate) async fn partition_key_ranges(
        &self,
        collection: &CollectionLink,
    ) -> QueryResult<Vec<PartitionKeyRange>> {
        let operation = Operation::PartitionKeyRanges {
            collection: collection.clone(),
        };
        match self.executor.execute(self.transport.as_ref(), &operation).await? {
            Response::PartitionKeyRanges(ranges) => Ok(ranges),
            other => Err(unexpected(&operation, &other)),
        }
    }

    pub(crate) async fn read_feed(&self, request: FeedRequest) -> QueryResult<Page> {
        let operation = Operation::ReadFeed(request);
        match self.executor.execute(self.transport.as_ref(), &operation).await? {
            Response::Page(page) => Ok(page),
            other => Err(unexpected(&operation, &other)),
        }
    }
}

fn unexpected(operation: &Operation, response: &Response) -> QueryError {
    let got = match response {
        Response::QueryPlan(_) => "query plan",
        Response::PartitionKeyRanges(_) => "partition key ranges",
        Response::Page(_) => "page",
    };
    QueryError::with_message(
        ErrorCode::InternalError,
        format!("executor returned a {} for a {} operation", got, operation.name()),
    )
}
