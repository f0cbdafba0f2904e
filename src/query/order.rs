//! ORDER BY comparison and the k-way merge head.

use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::models::{Document, OrderByItem, SortOrder};

/// Sort key of one document: one entry per ORDER BY item, `None` when undefined.
pub type SortKey = Vec<Option<Value>>;

/// Extracts the sort key of a document.
pub fn sort_key(document: &Document, order_by: &[OrderByItem]) -> SortKey {
    order_by
        .iter()
        .map(|item| value_at(document, &item.path).cloned())
        .collect()
}

/// Looks up a nested property by a path such as `/a/b`.
pub fn value_at<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.trim_start_matches('/').split('/');
    let mut current = document.get(segments.next()?);
    for segment in segments {
        current = current?.get(segment);
    }
    current
}

/// Orders values the way the service does: undefined, null, booleans, numbers,
/// strings, arrays, objects.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x @ Value::Array(_)), Some(y @ Value::Array(_)))
        | (Some(x @ Value::Object(_)), Some(y @ Value::Object(_))) => {
            x.to_string().cmp(&y.to_string())
        }
        _ => Ordering::Equal,
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None => 0,
        Some(Value::Null) => 1,
        Some(Value::Bool(_)) => 2,
        Some(Value::Number(_)) => 3,
        Some(Value::String(_)) => 4,
        Some(Value::Array(_)) => 5,
        Some(Value::Object(_)) => 6,
    }
}

/// Compares two sort keys honoring each item's direction.
pub fn compare_keys(a: &[Option<Value>], b: &[Option<Value>], order_by: &[OrderByItem]) -> Ordering {
    for ((x, y), item) in a.iter().zip(b.iter()).zip(order_by.iter()) {
        let ord = compare_values(x.as_ref(), y.as_ref());
        let ord = match item.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// The buffered head item of one range, as seen by the merge heap.
///
/// `BinaryHeap` is a max-heap, so the ordering is inverted: the entry that sorts
/// first compares greatest. Ties go to the range with the lower `min_inclusive`.
#[derive(Debug, Clone)]
pub(crate) struct MergeHead {
    pub(crate) key: SortKey,
    pub(crate) min_inclusive: String,
    pub(crate) cursor_id: u64,
    pub(crate) order_by: Arc<[OrderByItem]>,
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(&self.key, &other.key, &self.order_by)
            .then_with(|| self.min_inclusive.cmp(&other.min_inclusive))
            .then_with(|| self.cursor_id.cmp(&other.cursor_id))
            .reverse()
    }
}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BinaryHeap;

    fn asc(path: &str) -> OrderByItem {
        OrderByItem {
            path: path.to_string(),
            order: SortOrder::Ascending,
        }
    }

    #[test]
    fn test_type_ordering() {
        let null = json!(null);
        let num = json!(1);
        let text = json!("a");
        assert_eq!(compare_values(None, Some(&null)), Ordering::Less);
        assert_eq!(compare_values(Some(&null), Some(&num)), Ordering::Less);
        assert_eq!(compare_values(Some(&num), Some(&text)), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(2.5)), Some(&json!(10))), Ordering::Less);
    }

    #[test]
    fn test_descending_reverses() {
        let order_by = [OrderByItem {
            path: "/n".to_string(),
            order: SortOrder::Descending,
        }];
        let a = vec![Some(json!(1))];
        let b = vec![Some(json!(2))];
        assert_eq!(compare_keys(&a, &b, &order_by), Ordering::Greater);
    }

    #[test]
    fn test_sort_key_nested_and_missing() {
        let doc = json!({"a": {"b": 3}});
        let key = sort_key(doc.as_object().unwrap(), &[asc("/a/b"), asc("/missing")]);
        assert_eq!(key, vec![Some(json!(3)), None]);
    }

    #[test]
    fn test_heap_pops_smallest_then_lowest_range() {
        let order_by: Arc<[OrderByItem]> = vec![asc("/n")].into();
        let head = |n: i64, min: &str, id: u64| MergeHead {
            key: vec![Some(json!(n))],
            min_inclusive: min.to_string(),
            cursor_id: id,
            order_by: order_by.clone(),
        };

        let mut heap = BinaryHeap::new();
        heap.push(head(5, "", 0));
        heap.push(head(2, "8000000000000000", 1));
        heap.push(head(2, "4000000000000000", 2));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|h| h.cursor_id)).collect();
        assert_eq!(order, vec![2, 1, 0]);
    }
}
