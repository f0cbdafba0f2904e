//! Response pages and their headers.

use http::header::{HeaderMap, HeaderName, HeaderValue, ETAG};

use super::Document;
use crate::error::{ErrorCode, QueryError, QueryResult};

/// Header names used on feed responses.
pub mod headers {
    pub const CONTINUATION: &str = "x-ms-continuation";
    pub const REQUEST_CHARGE: &str = "x-ms-request-charge";
    pub const QUERY_METRICS: &str = "x-ms-documentdb-query-metrics";
    pub const ACTIVITY_ID: &str = "x-ms-activity-id";
    pub const SESSION_TOKEN: &str = "x-ms-session-token";
    pub const ITEM_COUNT: &str = "x-ms-item-count";
    pub const THROTTLE_RETRY_COUNT: &str = "x-ms-throttle-retry-count";
    pub const PARTITION_KEY_RANGE_ID: &str = "x-ms-documentdb-partitionkeyrangeid";
}

/// Headers of a single response, with typed accessors for the ones the core reads.
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    map: HeaderMap,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a header, replacing any previous value.
    pub fn insert(&mut self, name: &'static str, value: impl AsRef<str>) -> QueryResult<()> {
        let value = HeaderValue::from_str(value.as_ref()).map_err(|_| {
            QueryError::with_message(
                ErrorCode::InternalError,
                format!("invalid value for header {}", name),
            )
        })?;
        self.map.insert(HeaderName::from_static(name), value);
        Ok(())
    }

    /// Returns the value of a header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the ETag header value.
    pub fn etag(&self) -> Option<&str> {
        self.map.get(ETAG).and_then(|v| v.to_str().ok())
    }

    /// Returns the x-ms-continuation header value.
    pub fn continuation(&self) -> Option<&str> {
        self.get(headers::CONTINUATION).filter(|v| !v.is_empty())
    }

    /// Returns the request charge in request units.
    pub fn request_charge(&self) -> f64 {
        self.get(headers::REQUEST_CHARGE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }

    /// Returns the raw query metrics string, exactly as the service sent it.
    pub fn query_metrics(&self) -> Option<&str> {
        self.get(headers::QUERY_METRICS)
    }

    /// Returns the x-ms-activity-id header value.
    pub fn activity_id(&self) -> Option<&str> {
        self.get(headers::ACTIVITY_ID)
    }

    /// Returns the x-ms-session-token header value.
    pub fn session_token(&self) -> Option<&str> {
        self.get(headers::SESSION_TOKEN)
    }

    /// Returns the number of retries that preceded this response.
    pub fn throttle_retry_count(&self) -> u32 {
        self.get(headers::THROTTLE_RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// One response page for one partition key range.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Document>,
    /// Token to request the next page. `None` means the range is exhausted for
    /// queries; change feed pages always carry the latest etag.
    pub continuation: Option<String>,
    pub headers: ResponseHeaders,
}

impl Page {
    pub fn new(items: Vec<Document>, continuation: Option<String>, headers: ResponseHeaders) -> Self {
        Self {
            items,
            continuation: continuation.filter(|c| !c.is_empty()),
            headers,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Parsed `key=value;key=value` query metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMetrics {
    pairs: Vec<(String, String)>,
}

impl QueryMetrics {
    /// Parses a metrics header. Every segment must contain `=`.
    pub fn parse(raw: &str) -> QueryResult<Self> {
        let pairs = raw
            .split(';')
            .filter(|segment| !segment.is_empty())
            .map(|segment| {
                segment
                    .split_once('=')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                    .ok_or_else(|| {
                        QueryError::with_message(
                            ErrorCode::InternalError,
                            format!("malformed query metrics segment '{}'", segment),
                        )
                    })
            })
            .collect::<QueryResult<Vec<_>>>()?;
        Ok(Self { pairs })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
