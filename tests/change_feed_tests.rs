//! Change feed tests.

mod common;

use futures::{StreamExt, TryStreamExt};
use serde_json::json;

use common::{ids, sorted_ids, TestEnv};
use cosmos_pager::{ChangeFeedOptions, Document, ErrorCode, PartitionKey};

fn joined(documents: &[Document]) -> String {
    ids(documents).iter().map(|id| format!("{}.", id)).collect()
}

#[tokio::test]
async fn test_query_change_feed() {
    let env = TestEnv::new();
    let link = env.link();
    let range_id = env
        .emulator
        .range_for_partition_key(&env.link, &PartitionKey::from("pk"))
        .unwrap();

    // Whole collection, default options
    let mut feed = env
        .client
        .query_items_change_feed(&link, ChangeFeedOptions::new())
        .unwrap();
    assert!(feed.collect_items().await.unwrap().is_empty());

    // One range, from now
    let mut options = ChangeFeedOptions::new().partition_key_range_id(range_id.clone());
    let mut feed = env.client.query_items_change_feed(&link, options.clone()).unwrap();
    assert!(feed.collect_items().await.unwrap().is_empty());
    let etag = feed.response_headers().unwrap().etag().unwrap();
    assert_ne!(etag, "");

    // One range, from the beginning
    options.is_start_from_beginning = true;
    let mut feed = env.client.query_items_change_feed(&link, options.clone()).unwrap();
    assert!(feed.collect_items().await.unwrap().is_empty());
    let continuation1 = feed.response_headers().unwrap().etag().unwrap().to_string();
    assert_ne!(continuation1, "");

    // A new document shows up
    env.create(json!({"id": "doc1", "pk": "pk"}));
    let mut feed = env.client.query_items_change_feed(&link, options.clone()).unwrap();
    let items = feed.collect_items().await.unwrap();
    assert_eq!(ids(&items), vec!["doc1"]);
    let continuation2 = feed.response_headers().unwrap().etag().unwrap().to_string();
    assert_ne!(continuation2, "");
    assert_ne!(continuation2, continuation1);

    // Two more documents, read with page sizes 1 and 100
    env.create(json!({"id": "doc2", "pk": "pk"}));
    env.create(json!({"id": "doc3", "pk": "pk"}));
    options.is_start_from_beginning = false;

    for page_size in [1usize, 100] {
        options.continuation = Some(continuation2.clone());
        options.max_item_count = Some(page_size as u32);

        // as a stream
        let mut feed = env.client.query_items_change_feed(&link, options.clone()).unwrap();
        let items = feed.collect_items().await.unwrap();
        assert_eq!(joined(&items), "doc2.doc3.");

        // block by block
        let mut feed = env.client.query_items_change_feed(&link, options.clone()).unwrap();
        let expected_count = 2;
        let mut count = 0;
        let mut all = Vec::new();
        loop {
            let block = feed.fetch_next_block().await.unwrap();
            assert_eq!(block.len(), page_size.min(expected_count - count));
            count += block.len();
            if block.is_empty() {
                break;
            }
            all.extend(block);
        }
        assert_eq!(joined(&all), "doc2.doc3.");
        assert!(feed.fetch_next_block().await.unwrap().is_empty());
    }

    // From the beginning again
    options.is_start_from_beginning = true;
    options.continuation = None;
    options.max_item_count = None;
    let mut feed = env.client.query_items_change_feed(&link, options.clone()).unwrap();
    let first: Vec<Document> = feed.items().take(3).try_collect().await.unwrap();
    assert_eq!(ids(&first), vec!["doc1", "doc2", "doc3"]);
    let continuation3 = feed.response_headers().unwrap().etag().unwrap().to_string();

    // Nothing after the latest etag
    options.continuation = Some(continuation3);
    let mut feed = env.client.query_items_change_feed(&link, options).unwrap();
    assert!(feed.collect_items().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_feed_polls_every_time() {
    let env = TestEnv::with_ranges(1);
    let options = ChangeFeedOptions::new().partition_key_range_id("0");
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();

    assert!(feed.fetch_next_block().await.unwrap().is_empty());
    let calls = env.calls();
    for i in 1..=3 {
        assert!(feed.fetch_next_block().await.unwrap().is_empty());
        assert_eq!(env.calls(), calls + i);
    }

    env.create(json!({"id": "late", "pk": "a"}));
    let block = feed.fetch_next_block().await.unwrap();
    assert_eq!(ids(&block), vec!["late"]);
}

#[tokio::test]
async fn test_now_is_pinned_at_first_poll() {
    let env = TestEnv::with_ranges(1);
    env.create(json!({"id": "before", "pk": "a"}));

    let mut feed = env
        .client
        .query_items_change_feed(&env.link(), ChangeFeedOptions::new())
        .unwrap();
    // Written before the first poll, so not part of the feed.
    env.create(json!({"id": "between", "pk": "a"}));
    assert!(feed.fetch_next_block().await.unwrap().is_empty());

    env.create(json!({"id": "after", "pk": "a"}));
    assert_eq!(ids(&feed.fetch_next_block().await.unwrap()), vec!["after"]);
}

#[tokio::test]
async fn test_whole_collection_feed_preserves_per_range_order() {
    let env = TestEnv::new();
    let seeded = env.seed(20, 20);

    let options = ChangeFeedOptions::new()
        .start_from_beginning(true)
        .max_item_count(3);
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();
    let mut all = Vec::new();
    loop {
        let block = feed.fetch_next_block().await.unwrap();
        if block.is_empty() {
            break;
        }
        assert!(block.len() <= 3);
        all.extend(block);
    }
    assert_eq!(sorted_ids(&all), sorted_ids(&seeded));

    for range in env.emulator.ranges(&env.link).unwrap() {
        let lsns: Vec<u64> = all
            .iter()
            .filter(|d| {
                let key = PartitionKey::from(d["pk"].as_str().unwrap());
                range.contains(&key.effective_partition_key())
            })
            .map(|d| d["_lsn"].as_u64().unwrap())
            .collect();
        assert!(lsns.windows(2).all(|w| w[0] < w[1]), "range {}", range.id);
    }
}

#[tokio::test]
async fn test_whole_collection_token_resumes() {
    let env = TestEnv::new();
    env.seed(10, 10);

    let options = ChangeFeedOptions::new().start_from_beginning(true);
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();
    assert_eq!(feed.collect_items().await.unwrap().len(), 10);
    let token = feed.continuation().unwrap().unwrap();
    assert!(token.starts_with("cpt1."));

    env.create(json!({"id": "new-1", "pk": "x"}));
    env.create(json!({"id": "new-2", "pk": "y"}));

    let options = ChangeFeedOptions::new()
        .start_from_beginning(true)
        .continuation(token);
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();
    let items = feed.collect_items().await.unwrap();
    assert_eq!(sorted_ids(&items), vec!["new-1", "new-2"]);
}

#[tokio::test]
async fn test_single_range_continuation_is_raw_etag() {
    let env = TestEnv::with_ranges(2);
    env.create(json!({"id": "a", "pk": "a"}));
    let range_id = env
        .emulator
        .range_for_partition_key(&env.link, &PartitionKey::from("a"))
        .unwrap();

    let options = ChangeFeedOptions::new()
        .partition_key_range_id(range_id)
        .start_from_beginning(true);
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();
    feed.collect_items().await.unwrap();

    let continuation = feed.continuation().unwrap();
    let etag = feed.response_headers().unwrap().etag().map(str::to_string);
    assert_eq!(continuation, etag);
}

#[tokio::test]
async fn test_partition_key_feed_filters_changes() {
    let env = TestEnv::new();
    env.seed(12, 3);

    let options = ChangeFeedOptions::new()
        .partition_key("pk-1")
        .start_from_beginning(true);
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();
    let items = feed.collect_items().await.unwrap();

    assert_eq!(ids(&items), vec!["doc-1", "doc-4", "doc-7", "doc-10"]);
}

#[tokio::test]
async fn test_upsert_moves_document_to_end_of_feed() {
    let env = TestEnv::with_ranges(1);
    env.create(json!({"id": "a", "pk": "k"}));
    env.create(json!({"id": "b", "pk": "k"}));
    env.emulator
        .upsert_item(&env.link, common::doc(json!({"id": "a", "pk": "k", "v": 2})))
        .unwrap();

    let options = ChangeFeedOptions::new().start_from_beginning(true);
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();
    let items = feed.collect_items().await.unwrap();
    assert_eq!(ids(&items), vec!["b", "a"]);
    assert_eq!(items[1]["v"], json!(2));
}

#[tokio::test]
async fn test_conflicting_scopes_rejected() {
    let env = TestEnv::new();
    let options = ChangeFeedOptions::new()
        .partition_key_range_id("0")
        .partition_key("a");
    let err = env
        .client
        .query_items_change_feed(&env.link(), options)
        .err()
        .unwrap();
    assert_eq!(err.code, ErrorCode::InvalidOptions);
}

#[tokio::test]
async fn test_unknown_range_id_is_fatal() {
    let env = TestEnv::new();
    let options = ChangeFeedOptions::new().partition_key_range_id("99");
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();

    let err = feed.fetch_next_block().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::PartitionKeyRangeNotFound);
}

#[tokio::test]
async fn test_etag_cannot_resume_whole_collection_feed() {
    let env = TestEnv::new();
    let options = ChangeFeedOptions::new().continuation("\"3\"");
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();

    let err = feed.fetch_next_block().await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidContinuation);
    assert!(feed.fetch_next_block().await.is_err());
}

#[tokio::test]
async fn test_whole_collection_token_rejected_by_narrower_feed() {
    let env = TestEnv::new();
    env.seed(10, 10);

    let options = ChangeFeedOptions::new().start_from_beginning(true);
    let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();
    feed.collect_items().await.unwrap();
    let token = feed.continuation().unwrap().unwrap();

    let narrower = [
        ChangeFeedOptions::new().partition_key_range_id("3"),
        ChangeFeedOptions::new().partition_key("pk-1"),
    ];
    for options in narrower {
        let options = options.continuation(token.clone());
        let mut feed = env.client.query_items_change_feed(&env.link(), options).unwrap();

        let err = feed.fetch_next_block().await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidContinuation);
        assert!(feed.fetch_next_block().await.is_err());
    }
}
