//! Retry and executor layering tests.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{TestEnv, MAX_ATTEMPTS};
use cosmos_pager::{
    ChangeFeedOptions, CountingExecutor, DirectExecutor, ErrorCode, FaultTarget, QueryOptions,
    RequestExecutor, RetryPolicy, RetryingExecutor,
};

#[tokio::test]
async fn test_throttled_page_is_retried_transparently() {
    let env = TestEnv::new();
    env.create(json!({"id": "a", "pk": "k"}));
    env.emulator
        .inject_fault(ErrorCode::Throttled, FaultTarget::ReadFeed, 2);

    let options = QueryOptions::new().partition_key("k");
    let mut query = env
        .client
        .query_items(&env.link(), "SELECT * FROM c", options)
        .unwrap();
    let block = query.fetch_next_block().await.unwrap();

    assert_eq!(block.len(), 1);
    // Ranges listing, then two throttled attempts and one success.
    assert_eq!(env.calls(), 4);
    assert_eq!(query.response_headers().unwrap().throttle_retry_count(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_block_but_not_the_iterator() {
    let env = TestEnv::with_ranges(1);
    env.seed(6, 6);

    let options = QueryOptions::new()
        .enable_cross_partition_query(true)
        .max_item_count(2);
    let mut query = env
        .client
        .query_items(&env.link(), "SELECT * FROM c ORDER BY c.n", options)
        .unwrap();
    let first = query.fetch_next_block().await.unwrap();
    assert_eq!(first.len(), 2);

    env.emulator
        .inject_fault(ErrorCode::ServiceUnavailable, FaultTarget::ReadFeed, MAX_ATTEMPTS);
    let err = query.fetch_next_block().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RetriesExhausted);
    assert!(!err.is_configuration());

    let mut values: Vec<i64> = first.iter().map(|d| d["n"].as_i64().unwrap()).collect();
    let rest = query.collect_items().await.unwrap();
    values.extend(rest.iter().map(|d| d["n"].as_i64().unwrap()));
    assert_eq!(values, (0..6).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_fatal_errors_are_not_retried() {
    let env = TestEnv::new();
    env.emulator
        .inject_fault(ErrorCode::Forbidden, FaultTarget::PartitionKeyRanges, 1);

    let options = QueryOptions::new().partition_key("k");
    let mut query = env
        .client
        .query_items(&env.link(), "SELECT * FROM c", options)
        .unwrap();
    let err = query.fetch_next_block().await.unwrap_err();

    assert_eq!(err.code, ErrorCode::Forbidden);
    assert!(err.activity_id.is_some());
    assert_eq!(env.calls(), 1);

    // The fault is spent; the iterator starts over cleanly.
    assert!(query.fetch_next_block().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_hint_is_honored() {
    let env = TestEnv::with_ranges(1);
    env.emulator.inject_fault_with_retry_after(
        ErrorCode::Throttled,
        FaultTarget::Any,
        Duration::from_millis(250),
        1,
    );

    let start = tokio::time::Instant::now();
    let mut feed = env
        .client
        .query_items_change_feed(&env.link(), ChangeFeedOptions::new())
        .unwrap();
    feed.fetch_next_block().await.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn test_default_executor_backs_off_and_gives_up() {
    let env = TestEnv::with_executor(1, |calls| {
        Arc::new(RetryingExecutor::with_inner(
            RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(150),
            },
            CountingExecutor::with_counter(DirectExecutor, calls),
        ))
    });
    env.emulator
        .inject_fault(ErrorCode::RequestTimeout, FaultTarget::Any, 10);

    let start = tokio::time::Instant::now();
    let mut feed = env
        .client
        .query_items_change_feed(&env.link(), ChangeFeedOptions::new())
        .unwrap();
    let err = feed.fetch_next_block().await.unwrap_err();

    assert_eq!(err.code, ErrorCode::RetriesExhausted);
    assert_eq!(env.calls(), 4);
    // Backoffs of 100, 150 and 150 ms before jitter.
    assert!(start.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_retrying_executor_counts_attempts() {
    let executor = Arc::new(RetryingExecutor::new(RetryPolicy::immediate(5)));
    let env = TestEnv::with_executor(1, {
        let executor = executor.clone();
        move |_| -> Arc<dyn RequestExecutor> { executor }
    });
    env.emulator
        .inject_fault(ErrorCode::Throttled, FaultTarget::PartitionKeyRanges, 2);

    let mut feed = env
        .client
        .query_items_change_feed(&env.link(), ChangeFeedOptions::new())
        .unwrap();
    feed.fetch_next_block().await.unwrap();

    // Three attempts for the ranges listing, one poll.
    assert_eq!(executor.attempts(), 4);
    assert_eq!(env.emulator.served(), 4);
}

#[tokio::test]
async fn test_one_failing_range_fails_the_whole_merge() {
    let env = TestEnv::new();
    env.seed(30, 30);
    env.emulator.inject_fault(
        ErrorCode::ServiceUnavailable,
        FaultTarget::Range("2".to_string()),
        MAX_ATTEMPTS,
    );

    let options = QueryOptions::new()
        .enable_cross_partition_query(true)
        .max_item_count(4);
    let mut query = env
        .client
        .query_items(&env.link(), "SELECT * FROM c ORDER BY c.n", options)
        .unwrap();

    let err = query.fetch_next_block().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RetriesExhausted);
    assert!(query.response_headers().is_none());

    let items = query.collect_items().await.unwrap();
    let values: Vec<i64> = items.iter().map(|d| d["n"].as_i64().unwrap()).collect();
    assert_eq!(values, (0..30).collect::<Vec<i64>>());
}
