//! Cosmos-pager demo: seeds an in-memory partitioned collection and pages through
//! a query or its change feed, reporting how many requests each read took.

use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use cosmos_pager::{
    Args, ChangeFeedOptions, ClientConfig, CountingExecutor, DirectExecutor, Emulator, FeedClient,
    QueryMetrics, QueryOptions, RetryingExecutor,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Parse command-line arguments
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug {
        Level::DEBUG
    } else if args.silent {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let config = ClientConfig::from(&args);

    // Seed the collection
    let emulator = Arc::new(Emulator::new());
    let link = emulator.create_collection("demo", "items", "/pk", args.ranges)?;
    let partition_keys = args.partition_keys.max(1);
    for i in 0..args.documents {
        let document = json!({
            "id": format!("item-{}", i),
            "pk": format!("pk-{}", i % partition_keys),
            "n": i,
        });
        if let Some(document) = document.as_object() {
            emulator.create_item(&link, document.clone())?;
        }
    }

    // Count every attempt the retry layer makes
    let counter = CountingExecutor::new(DirectExecutor);
    let calls = counter.counter();
    let executor = RetryingExecutor::with_inner(config.retry.clone(), counter);
    let client = FeedClient::builder(emulator.clone())
        .config(config)
        .executor(Arc::new(executor))
        .build();

    println!(
        "\nCollection {} with {} ranges and {} documents\n",
        link, args.ranges, args.documents
    );

    let mut block_number = 0;
    if args.change_feed {
        let options = ChangeFeedOptions::new()
            .start_from_beginning(true)
            .max_item_count(args.max_item_count);
        let mut feed = client.query_items_change_feed(&link.to_string(), options)?;
        loop {
            let block = feed.fetch_next_block().await?;
            if block.is_empty() {
                break;
            }
            block_number += 1;
            let etag = feed
                .response_headers()
                .and_then(|h| h.etag())
                .unwrap_or_default()
                .to_string();
            println!("block {}: {} changes, etag {}", block_number, block.len(), etag);
        }
        println!("\ncontinuation: {}", feed.continuation()?.unwrap_or_default());
    } else {
        let options = QueryOptions::new()
            .enable_cross_partition_query(true)
            .max_item_count(args.max_item_count)
            .populate_query_metrics(args.metrics);
        let mut query = client.query_items(&link.to_string(), args.query.clone(), options)?;
        loop {
            let block = query.fetch_next_block().await?;
            if block.is_empty() {
                break;
            }
            block_number += 1;
            let ids: Vec<&str> = block
                .iter()
                .filter_map(|d| d.get("id").and_then(|v| v.as_str()))
                .collect();
            println!("block {}: {}", block_number, ids.join(", "));
            if let Some(raw) = query.response_headers().and_then(|h| h.query_metrics()) {
                for (name, value) in QueryMetrics::parse(raw)?.iter() {
                    println!("  {}: {}", name, value);
                }
            }
        }
        println!("\nrequest charge: {:.2}", query.total_request_charge());
    }

    println!(
        "requests: {}",
        calls.load(std::sync::atomic::Ordering::SeqCst)
    );
    Ok(())
}
