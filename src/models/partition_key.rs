//! Partition key values, hashing and header encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use super::Document;
use crate::error::{ErrorCode, QueryError, QueryResult};

/// A partition key value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(Value);

impl PartitionKey {
    /// Creates a partition key from a JSON scalar.
    pub fn new(value: Value) -> QueryResult<Self> {
        match value {
            Value::Array(_) | Value::Object(_) => Err(QueryError::with_message(
                ErrorCode::InvalidOptions,
                "partition key values must be strings, numbers, booleans or null",
            )),
            value => Ok(Self(value)),
        }
    }

    /// Extracts the partition key of a document given the key path, e.g. `/pk`.
    ///
    /// Documents without the property are treated as having a `null` key.
    pub fn from_document(document: &Document, path: &str) -> QueryResult<Self> {
        let mut segments = path.trim_start_matches('/').split('/');
        let first = segments.next().unwrap_or_default();
        let mut current = document.get(first);
        for segment in segments {
            current = current.and_then(|v| v.get(segment));
        }
        Self::new(current.cloned().unwrap_or(Value::Null))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Returns the effective partition key used to route this value to a range.
    ///
    /// The result is 16 upper-case hex digits and is always below [`super::MAX_EPK`].
    pub fn effective_partition_key(&self) -> String {
        let canonical = self.0.to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let hash = u64::from_be_bytes(prefix) % u64::MAX;
        format!("{:016X}", hash)
    }

    /// Encodes the key as a JSON array header value with non-ASCII characters escaped.
    ///
    /// This is the form an HTTP [`crate::Transport`] sends in the partition key
    /// header of a [`crate::FeedRequest`].
    pub fn to_header_value(&self) -> String {
        let json = Value::Array(vec![self.0.clone()]).to_string();
        escape_non_ascii(&json)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(Value::String(value))
    }
}

impl From<i64> for PartitionKey {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<bool> for PartitionKey {
    fn from(value: bool) -> Self {
        Self(Value::Bool(value))
    }
}

/// Escapes every non-ASCII character as `\uXXXX`, using surrogate pairs above the BMP.
fn escape_non_ascii(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_ascii() {
            out.push(ch);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            // Writing to a String cannot fail.
            let _ = write!(out, "\\u{:04x}", unit);
        }
    }
    out
}
