//! Query plans consumed by the iterator.

use serde::{Deserialize, Serialize};

use super::QueryRange;

/// Sort direction of one ORDER BY item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

impl SortOrder {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ASC" | "ASCENDING" => Some(SortOrder::Ascending),
            "DESC" | "DESCENDING" => Some(SortOrder::Descending),
            _ => None,
        }
    }
}

/// One ORDER BY item: a document path such as `/_ts` and its direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderByItem {
    pub path: String,
    pub order: SortOrder,
}

/// Logical plan for a query, produced by the service's plan compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    /// ORDER BY items, outermost first. Empty for unordered queries.
    #[serde(default)]
    pub order_by: Vec<OrderByItem>,
    /// Effective partition key ranges the query can touch. Empty means all.
    #[serde(default)]
    pub query_ranges: Vec<QueryRange>,
    /// Query text to send per range, when the service rewrote it.
    #[serde(default)]
    pub rewritten_query: Option<String>,
}

impl QueryPlan {
    /// Returns whether results must be merged in a global order.
    pub fn is_ordered(&self) -> bool {
        !self.order_by.is_empty()
    }
}
