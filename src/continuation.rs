//! Opaque continuation tokens.
//!
//! A token is either nothing (start of the feed), a raw etag for a single range,
//! or a versioned, base64 encoded list of per-range positions.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, QueryError, QueryResult};
use crate::models::PartitionKeyRange;

/// Prefix marking an encoded multi-range token.
const RANGES_PREFIX: &str = "cpt1.";

/// Resume position within one partition key range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeContinuation {
    #[serde(rename = "id")]
    pub range_id: String,
    #[serde(rename = "min")]
    pub min_inclusive: String,
    #[serde(rename = "max")]
    pub max_exclusive: String,
    /// Server token that produces the next page; `None` starts the range over.
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Items of that page already handed to the caller.
    #[serde(rename = "s", default, skip_serializing_if = "is_zero")]
    pub skip: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl RangeContinuation {
    pub fn new(range: &PartitionKeyRange, token: Option<String>, skip: usize) -> Self {
        Self {
            range_id: range.id.clone(),
            min_inclusive: range.min_inclusive.clone(),
            max_exclusive: range.max_exclusive.clone(),
            token,
            skip,
        }
    }

    /// Returns whether this position was recorded against the given range.
    pub fn matches(&self, range: &PartitionKeyRange) -> bool {
        self.range_id == range.id
            && self.min_inclusive == range.min_inclusive
            && self.max_exclusive == range.max_exclusive
    }
}

/// Decoded form of an opaque continuation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinuationToken {
    /// No progress recorded.
    Start,
    /// A single range's change feed etag, passed through verbatim.
    Etag(String),
    /// Per-range positions.
    Ranges(Vec<RangeContinuation>),
}

impl ContinuationToken {
    /// Encodes the token. `Start` has no encoded form.
    pub fn encode(&self) -> QueryResult<Option<String>> {
        match self {
            ContinuationToken::Start => Ok(None),
            ContinuationToken::Etag(etag) => Ok(Some(etag.clone())),
            ContinuationToken::Ranges(ranges) => {
                let json = serde_json::to_vec(ranges).map_err(|e| {
                    QueryError::with_message(
                        ErrorCode::InternalError,
                        format!("failed to encode continuation: {}", e),
                    )
                })?;
                Ok(Some(format!("{}{}", RANGES_PREFIX, BASE64.encode(json))))
            }
        }
    }

    /// Decodes a token previously produced by [`ContinuationToken::encode`] or a raw etag.
    pub fn decode(token: &str) -> QueryResult<Self> {
        if token.is_empty() {
            return Ok(ContinuationToken::Start);
        }

        let Some(payload) = token.strip_prefix(RANGES_PREFIX) else {
            return Ok(ContinuationToken::Etag(token.to_string()));
        };

        let bytes = BASE64
            .decode(payload)
            .map_err(|_| QueryError::new(ErrorCode::InvalidContinuation))?;
        let ranges: Vec<RangeContinuation> = serde_json::from_slice(&bytes)
            .map_err(|_| QueryError::new(ErrorCode::InvalidContinuation))?;
        Ok(ContinuationToken::Ranges(ranges))
    }
}
