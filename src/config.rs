//! Client and demo configuration.

use clap::Parser;
use std::time::Duration;

/// Default page size hint when a request does not set `max_item_count`.
pub const DEFAULT_MAX_ITEM_COUNT: u32 = 100;

/// Default number of attempts (original plus retries) for transient failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 9;

/// Default upper bound on concurrent per-range requests during fan-out.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// Retry policy for transient request failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the original one.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubled on each later retry.
    pub base_delay: Duration,
    /// Cap applied to each computed backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, used by tests and the emulator demo.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Returns the exponential backoff for the given retry number (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Page size hint used when options leave `max_item_count` unset.
    pub default_max_item_count: u32,
    /// Retry policy applied by the default executor.
    pub retry: RetryPolicy,
    /// Maximum per-range requests in flight during one fan-out.
    pub max_concurrent_requests: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_max_item_count: DEFAULT_MAX_ITEM_COUNT,
            retry: RetryPolicy::default(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }
}

/// Command-line arguments for the demo binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "cosmos-pager")]
#[command(about = "Runs a paged query or change feed read against an in-memory partitioned collection")]
#[command(version)]
pub struct Args {
    /// Number of partition key ranges in the collection.
    #[arg(long, default_value_t = 5)]
    pub ranges: u32,

    /// Number of documents to seed.
    #[arg(long, default_value_t = 10)]
    pub documents: u32,

    /// Number of distinct partition key values used when seeding.
    #[arg(long, default_value_t = 1)]
    pub partition_keys: u32,

    /// Page size hint.
    #[arg(long, short = 'n', default_value_t = DEFAULT_MAX_ITEM_COUNT)]
    pub max_item_count: u32,

    /// Query text to execute.
    #[arg(long, short = 'q', default_value = "SELECT * FROM c ORDER BY c._ts")]
    pub query: String,

    /// Read the change feed from the beginning instead of running a query.
    #[arg(long)]
    pub change_feed: bool,

    /// Request query metrics on every response.
    #[arg(long)]
    pub metrics: bool,

    /// Total attempts per request for transient failures.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Enable debug logging.
    #[arg(long, short = 'd')]
    pub debug: bool,

    /// Enable silent mode (minimal logging).
    #[arg(long, short = 's')]
    pub silent: bool,
}

impl From<&Args> for ClientConfig {
    fn from(args: &Args) -> Self {
        Self {
            default_max_item_count: args.max_item_count.max(1),
            retry: RetryPolicy {
                max_attempts: args.max_attempts.max(1),
                ..RetryPolicy::default()
            },
            ..ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn test_config_from_args() {
        let args = Args::parse_from(["cosmos-pager", "-n", "0", "--max-attempts", "3"]);
        let config = ClientConfig::from(&args);
        assert_eq!(config.default_max_item_count, 1);
        assert_eq!(config.retry.max_attempts, 3);
    }
}
