//! Common test utilities.

#![allow(dead_code)]

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cosmos_pager::{
    CollectionLink, CountingExecutor, DirectExecutor, Document, Emulator, FeedClient,
    RequestExecutor, RetryPolicy, RetryingExecutor,
};

/// Ranges in the default test collection.
pub const RANGES: u32 = 5;

/// Attempts per request in the default test executor.
pub const MAX_ATTEMPTS: u32 = 3;

/// An emulator with one collection and a client whose every attempt is counted.
pub struct TestEnv {
    pub emulator: Arc<Emulator>,
    pub link: CollectionLink,
    pub client: FeedClient,
    pub calls: Arc<AtomicU64>,
}

impl TestEnv {
    /// Creates a collection with [`RANGES`] ranges partitioned on `/pk`.
    pub fn new() -> Self {
        Self::with_ranges(RANGES)
    }

    pub fn with_ranges(ranges: u32) -> Self {
        Self::with_executor(ranges, |calls| {
            Arc::new(RetryingExecutor::with_inner(
                RetryPolicy::immediate(MAX_ATTEMPTS),
                CountingExecutor::with_counter(DirectExecutor, calls),
            ))
        })
    }

    /// Creates the environment with a custom executor built around the shared counter.
    pub fn with_executor(
        ranges: u32,
        executor: impl FnOnce(Arc<AtomicU64>) -> Arc<dyn RequestExecutor>,
    ) -> Self {
        let emulator = Arc::new(Emulator::new());
        let link = emulator
            .create_collection("testdb", "testcoll", "/pk", ranges)
            .unwrap();
        let calls = Arc::new(AtomicU64::new(0));
        let client = FeedClient::builder(emulator.clone())
            .executor(executor(calls.clone()))
            .build();

        Self {
            emulator,
            link,
            client,
            calls,
        }
    }

    /// The collection link as callers pass it.
    pub fn link(&self) -> String {
        self.link.to_string()
    }

    /// Requests issued through the client since the last reset.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    /// Creates a document in the test collection.
    pub fn create(&self, value: Value) -> Document {
        self.emulator.create_item(&self.link, doc(value)).unwrap()
    }

    /// Creates `count` documents with ids `doc-<i>`, numeric field `n` and
    /// partition keys spread over `keys` values.
    pub fn seed(&self, count: usize, keys: usize) -> Vec<Document> {
        (0..count)
            .map(|i| {
                self.create(serde_json::json!({
                    "id": format!("doc-{}", i),
                    "pk": format!("pk-{}", i % keys.max(1)),
                    "n": (i * 7) % count.max(1),
                }))
            })
            .collect()
    }
}

/// Converts a JSON object literal into a document.
pub fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("document must be a JSON object")
}

/// Ids of the documents, in order.
pub fn ids(documents: &[Document]) -> Vec<String> {
    documents
        .iter()
        .map(|d| d["id"].as_str().unwrap_or_default().to_string())
        .collect()
}

/// Ids sorted, for order-independent comparisons.
pub fn sorted_ids(documents: &[Document]) -> Vec<String> {
    let mut ids = ids(documents);
    ids.sort();
    ids
}
