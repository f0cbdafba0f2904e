//! In-memory state of one emulated collection.

use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

use super::query::{ParsedQuery, QueryPosition};
use crate::error::{ErrorCode, QueryError, QueryResult};
use crate::models::{Document, PartitionKey, PartitionKeyRange, MAX_EPK, MIN_EPK};
use crate::query::order::{compare_keys, sort_key, value_at, SortKey};

/// A stored document with its routing and log metadata.
#[derive(Debug, Clone)]
pub(crate) struct StoredDocument {
    pub(crate) id: String,
    pub(crate) partition_key: PartitionKey,
    pub(crate) epk: String,
    /// Log sequence number of the latest write.
    pub(crate) lsn: u64,
    pub(crate) body: Document,
}

/// Documents, ranges and the change log position of a collection.
#[derive(Debug)]
pub(crate) struct CollectionState {
    pub(crate) partition_key_path: String,
    /// Current ranges, sorted by lower bound.
    pub(crate) ranges: Vec<PartitionKeyRange>,
    /// Ids of ranges removed by splits.
    pub(crate) gone: Vec<String>,
    pub(crate) documents: Vec<StoredDocument>,
    /// Last assigned log sequence number.
    pub(crate) lsn: u64,
    next_range_id: u64,
}

impl CollectionState {
    /// Creates a collection whose key space is cut into `range_count` equal ranges.
    pub(crate) fn new(partition_key_path: &str, range_count: u32) -> Self {
        let count = range_count.max(1) as u64;
        let step = u64::MAX / count;
        let ranges = (0..count)
            .map(|i| {
                let min = if i == 0 {
                    MIN_EPK.to_string()
                } else {
                    format!("{:016X}", step * i)
                };
                let max = if i + 1 == count {
                    MAX_EPK.to_string()
                } else {
                    format!("{:016X}", step * (i + 1))
                };
                PartitionKeyRange::new(i.to_string(), min, max)
            })
            .collect();

        Self {
            partition_key_path: partition_key_path.to_string(),
            ranges,
            gone: Vec::new(),
            documents: Vec::new(),
            lsn: 0,
            next_range_id: count,
        }
    }

    pub(crate) fn range(&self, id: &str) -> QueryResult<&PartitionKeyRange> {
        if let Some(range) = self.ranges.iter().find(|r| r.id == id) {
            return Ok(range);
        }
        if self.gone.iter().any(|g| g == id) {
            return Err(QueryError::with_message(
                ErrorCode::PartitionKeyRangeGone,
                format!("partition key range '{}' is gone", id),
            ));
        }
        Err(QueryError::with_message(
            ErrorCode::PartitionKeyRangeNotFound,
            format!("partition key range '{}' does not exist", id),
        ))
    }

    pub(crate) fn range_for(&self, partition_key: &PartitionKey) -> Option<&PartitionKeyRange> {
        let epk = partition_key.effective_partition_key();
        self.ranges.iter().find(|r| r.contains(&epk))
    }

    /// Stores a document, stamping system properties. Returns the stored body.
    pub(crate) fn write(&mut self, mut body: Document, upsert: bool) -> QueryResult<Document> {
        let id = match body.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => {
                return Err(QueryError::with_message(
                    ErrorCode::BadRequest,
                    "documents need a non-empty string 'id'",
                ))
            }
        };
        let partition_key = PartitionKey::from_document(&body, &self.partition_key_path)?;
        let existing = self
            .documents
            .iter()
            .position(|d| d.id == id && d.partition_key == partition_key);
        if existing.is_some() && !upsert {
            return Err(QueryError::with_message(
                ErrorCode::Conflict,
                format!("document '{}' already exists", id),
            ));
        }

        self.lsn += 1;
        let lsn = self.lsn;
        let rid = match existing {
            Some(index) => self.documents[index]
                .body
                .get("_rid")
                .cloned()
                .unwrap_or_else(|| Value::String(Uuid::new_v4().simple().to_string())),
            None => Value::String(Uuid::new_v4().simple().to_string()),
        };
        body.insert("_rid".to_string(), rid);
        body.insert("_ts".to_string(), Value::from(Utc::now().timestamp()));
        body.insert("_lsn".to_string(), Value::from(lsn));
        body.insert("_etag".to_string(), Value::String(format!("\"{}\"", Uuid::new_v4())));

        let stored = StoredDocument {
            id,
            epk: partition_key.effective_partition_key(),
            partition_key,
            lsn,
            body: body.clone(),
        };
        match existing {
            Some(index) => self.documents[index] = stored,
            None => self.documents.push(stored),
        }
        Ok(body)
    }

    /// Splits a range at the midpoint of its key interval.
    ///
    /// Returns the ids of the two new ranges.
    pub(crate) fn split(&mut self, id: &str) -> QueryResult<(String, String)> {
        let index = self
            .ranges
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| {
                QueryError::with_message(
                    ErrorCode::PartitionKeyRangeNotFound,
                    format!("partition key range '{}' does not exist", id),
                )
            })?;
        let parent = self.ranges[index].clone();
        let low = parse_bound(&parent.min_inclusive);
        let high = parse_bound(&parent.max_exclusive);
        if high - low < 2 {
            return Err(QueryError::with_message(
                ErrorCode::BadRequest,
                format!("partition key range '{}' is too small to split", id),
            ));
        }
        let mid = format!("{:016X}", low + (high - low) / 2);

        let mut parents = parent.parents.clone();
        parents.push(parent.id.clone());
        let left_id = self.next_range_id.to_string();
        let right_id = (self.next_range_id + 1).to_string();
        self.next_range_id += 2;

        let mut left = PartitionKeyRange::new(left_id.clone(), parent.min_inclusive.clone(), mid.clone());
        left.parents = parents.clone();
        let mut right = PartitionKeyRange::new(right_id.clone(), mid, parent.max_exclusive.clone());
        right.parents = parents;

        self.ranges.splice(index..=index, [left, right]);
        self.gone.push(parent.id);
        Ok((left_id, right_id))
    }

    /// Documents of a range that pass the optional partition key and query filters.
    fn documents_in<'a>(
        &'a self,
        range: &'a PartitionKeyRange,
        partition_key: Option<&'a PartitionKey>,
        filter: Option<&'a (String, Value)>,
    ) -> impl Iterator<Item = &'a StoredDocument> + 'a {
        self.documents.iter().filter(move |d| {
            range.contains(&d.epk)
                && partition_key.map_or(true, |pk| &d.partition_key == pk)
                && filter.map_or(true, |(path, value)| value_at(&d.body, path) == Some(value))
        })
    }

    /// Serves one query page. The returned token is `None` once the range has
    /// nothing after this page.
    pub(crate) fn query_page(
        &self,
        range_id: &str,
        query: &ParsedQuery,
        partition_key: Option<&PartitionKey>,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> QueryResult<(Vec<Document>, Option<String>)> {
        let range = self.range(range_id)?;
        let after = continuation.map(QueryPosition::decode).transpose()?;

        let mut matching: Vec<(SortKey, &StoredDocument)> = self
            .documents_in(range, partition_key, query.filter.as_ref())
            .map(|d| (sort_key(&d.body, &query.order_by), d))
            .collect();
        matching.sort_by(|(ka, a), (kb, b)| order(ka, a.lsn, kb, b.lsn, query));

        if let Some(after) = &after {
            let key = after.key();
            matching.retain(|(k, d)| order(k, d.lsn, &key, after.lsn(), query) == Ordering::Greater);
        }

        let has_more = matching.len() > max_item_count;
        matching.truncate(max_item_count.max(1));
        let continuation = match (has_more, matching.last()) {
            (true, Some((key, last))) => Some(QueryPosition::new(key, last.lsn).encode()?),
            _ => None,
        };
        let items = matching.into_iter().map(|(_, d)| d.body.clone()).collect();
        Ok((items, continuation))
    }

    /// Serves one change feed page: changes after `from`, oldest first.
    ///
    /// Returns the changes and the log position to resume from.
    pub(crate) fn change_feed_page(
        &self,
        range_id: &str,
        partition_key: Option<&PartitionKey>,
        from: u64,
        max_item_count: usize,
    ) -> QueryResult<(Vec<Document>, u64)> {
        let range = self.range(range_id)?;
        let mut changes: Vec<&StoredDocument> = self
            .documents_in(range, partition_key, None)
            .filter(|d| d.lsn > from)
            .collect();
        changes.sort_by_key(|d| d.lsn);
        changes.truncate(max_item_count.max(1));

        let position = changes.last().map_or(from, |d| d.lsn);
        Ok((changes.into_iter().map(|d| d.body.clone()).collect(), position))
    }
}

fn order(a: &SortKey, a_lsn: u64, b: &SortKey, b_lsn: u64, query: &ParsedQuery) -> Ordering {
    compare_keys(a, b, &query.order_by).then(a_lsn.cmp(&b_lsn))
}

fn parse_bound(bound: &str) -> u64 {
    if bound == MIN_EPK {
        return 0;
    }
    if bound == MAX_EPK {
        return u64::MAX;
    }
    u64::from_str_radix(bound, 16).unwrap_or(0)
}
