//! Cosmos-pager: paged cross-partition queries and change feeds for partitioned
//! document collections.
//!
//! A [`FeedClient`] turns one logical query or change feed read into the
//! per-partition-key-range requests it needs, merges ORDER BY results across
//! ranges, survives range splits, and hands out resumable continuation tokens.
//! Every network call goes through a [`RequestExecutor`], so retries and request
//! counting can be layered without touching iteration.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cosmos_pager::{Emulator, FeedClient, QueryOptions};
//!
//! #[tokio::main]
//! async fn main() -> cosmos_pager::QueryResult<()> {
//!     let emulator = Arc::new(Emulator::new());
//!     emulator.create_collection("db", "coll", "/pk", 5)?;
//!
//!     let client = FeedClient::new(emulator);
//!     let options = QueryOptions::new().enable_cross_partition_query(true);
//!     let mut query = client.query_items("dbs/db/colls/coll", "SELECT * FROM c", options)?;
//!     while !query.fetch_next_block().await?.is_empty() {}
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod continuation;
pub mod emulator;
pub mod error;
pub mod executor;
pub mod models;
pub mod query;
pub mod routing;
pub mod transport;

// Re-exports for convenience
pub use client::{FeedClient, FeedClientBuilder};
pub use config::{Args, ClientConfig, RetryPolicy};
pub use continuation::{ContinuationToken, RangeContinuation};
pub use emulator::{Emulator, FaultTarget};
pub use error::{ErrorCode, ErrorKind, QueryError, QueryResult};
pub use executor::{CountingExecutor, DirectExecutor, Operation, RequestExecutor, Response, RetryingExecutor};
pub use models::{
    ChangeFeedOptions, CollectionLink, Document, Page, PartitionKey, PartitionKeyRange,
    QueryMetrics, QueryOptions, ResponseHeaders,
};
pub use query::{ChangeFeedCursor, QueryIterator};
pub use routing::{PartitionKeyRangeResolver, RoutingScope};
pub use transport::{ChangeFeedStart, FeedKind, FeedRequest, Transport};
