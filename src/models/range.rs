//! Partition key ranges and effective partition key intervals.

use serde::{Deserialize, Serialize};

/// Lowest effective partition key; the inclusive minimum of the first range.
pub const MIN_EPK: &str = "";

/// Highest effective partition key; the exclusive maximum of the last range.
///
/// Effective partition keys are fixed-width, 16 upper-case hex digits, so plain
/// string comparison orders them. Hashing never produces this value.
pub const MAX_EPK: &str = "FFFFFFFFFFFFFFFF";

/// A contiguous slice of the effective partition key space owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
    /// Ids of the ranges this one was split from, oldest first.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: Vec::new(),
        }
    }

    /// Returns whether the effective partition key falls inside this range.
    pub fn contains(&self, epk: &str) -> bool {
        self.min_inclusive.as_str() <= epk && epk < self.max_exclusive.as_str()
    }

    /// Returns whether this range overlaps the given query range.
    pub fn overlaps(&self, query_range: &QueryRange) -> bool {
        // Query range ends before this range starts
        if query_range.max.as_str() < self.min_inclusive.as_str()
            || (query_range.max == self.min_inclusive && !query_range.is_max_inclusive)
        {
            return false;
        }

        // Query range starts at or after this range ends
        if query_range.min.as_str() >= self.max_exclusive.as_str() {
            return false;
        }

        true
    }

    /// Returns whether the two ranges share any key.
    pub fn intersects(&self, other: &PartitionKeyRange) -> bool {
        self.min_inclusive < other.max_exclusive && other.min_inclusive < self.max_exclusive
    }
}

/// An effective partition key interval a query is restricted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRange {
    pub min: String,
    pub max: String,
    pub is_min_inclusive: bool,
    pub is_max_inclusive: bool,
}

impl QueryRange {
    pub fn new(
        min: impl Into<String>,
        max: impl Into<String>,
        is_min_inclusive: bool,
        is_max_inclusive: bool,
    ) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
            is_min_inclusive,
            is_max_inclusive,
        }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self::new(MIN_EPK, MAX_EPK, true, false)
    }

    /// A single effective partition key.
    pub fn point(epk: impl Into<String>) -> Self {
        let epk = epk.into();
        Self::new(epk.clone(), epk, true, true)
    }
}

/// Retains the ranges that overlap at least one query range, preserving order.
///
/// An empty `query_ranges` slice means the whole key space.
pub fn overlapping_ranges(
    ranges: &[PartitionKeyRange],
    query_ranges: &[QueryRange],
) -> Vec<PartitionKeyRange> {
    if query_ranges.is_empty() {
        return ranges.to_vec();
    }

    ranges
        .iter()
        .filter(|range| query_ranges.iter().any(|qr| range.overlaps(qr)))
        .cloned()
        .collect()
}

/// Sorts ranges by their lower bound.
pub fn sort_ranges(ranges: &mut [PartitionKeyRange]) {
    ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
}
