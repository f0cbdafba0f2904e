//! Per-iterator state shared by queries and the change feed.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use super::order::{sort_key, MergeHead};
use crate::continuation::RangeContinuation;
use crate::error::QueryError;
use crate::models::{Document, OrderByItem, PartitionKeyRange};

/// Lifecycle of an iterator.
#[derive(Debug, Clone)]
pub(crate) enum Phase {
    /// No request issued yet.
    Created,
    Active,
    /// Every range is drained; sticky.
    Exhausted,
    /// A configuration error occurred; sticky.
    Failed(QueryError),
}

/// Progress within one partition key range.
#[derive(Debug)]
pub(crate) struct RangeCursor {
    pub(crate) id: u64,
    pub(crate) range: PartitionKeyRange,
    /// Server token for the next request; the etag for change feeds.
    pub(crate) continuation: Option<String>,
    /// Token that produced the buffered page.
    page_token: Option<String>,
    /// Items to drop from the next page, when resuming mid-page.
    pub(crate) skip: usize,
    /// Items of the buffered page already handed out.
    consumed: usize,
    pub(crate) buffer: VecDeque<Document>,
    /// The service reported no further pages.
    pub(crate) done: bool,
}

impl RangeCursor {
    /// Returns whether nothing is left to read or hand out.
    pub(crate) fn is_drained(&self) -> bool {
        self.done && self.buffer.is_empty()
    }

    /// Returns whether the merge needs a new page from this range.
    pub(crate) fn needs_page(&self) -> bool {
        self.buffer.is_empty() && !self.done
    }

    /// Buffers a query page fetched with the current continuation.
    pub(crate) fn apply_page(&mut self, items: Vec<Document>, continuation: Option<String>) {
        let mut items = VecDeque::from(items);
        let skipped = self.skip.min(items.len());
        items.drain(..skipped);

        self.page_token = self.continuation.take();
        self.consumed = skipped;
        self.skip = 0;
        self.buffer = items;
        self.done = continuation.is_none();
        self.continuation = continuation;
    }

    pub(crate) fn take_front(&mut self) -> Option<Document> {
        let item = self.buffer.pop_front()?;
        self.consumed += 1;
        Some(item)
    }

    /// Describes where a resumed iterator should pick this range up.
    pub(crate) fn resume_point(&self) -> Option<RangeContinuation> {
        if !self.buffer.is_empty() {
            return Some(RangeContinuation::new(
                &self.range,
                self.page_token.clone(),
                self.consumed,
            ));
        }
        if self.done {
            return None;
        }
        Some(RangeContinuation::new(
            &self.range,
            self.continuation.clone(),
            self.skip,
        ))
    }
}

/// Mutable state of one iterator. Never shared between iterators.
#[derive(Debug, Default)]
pub(crate) struct IteratorState {
    pub(crate) cursors: Vec<RangeCursor>,
    /// Items already taken from cursors but not yet returned to the caller.
    pub(crate) ready: VecDeque<Document>,
    /// One head per cursor with a non-empty buffer, for ordered merges.
    heap: BinaryHeap<MergeHead>,
    next_cursor_id: u64,
}

impl IteratorState {
    pub(crate) fn add_cursor(
        &mut self,
        range: PartitionKeyRange,
        continuation: Option<String>,
        skip: usize,
    ) {
        let cursor = self.new_cursor(range, continuation, skip);
        self.cursors.push(cursor);
    }

    fn new_cursor(
        &mut self,
        range: PartitionKeyRange,
        continuation: Option<String>,
        skip: usize,
    ) -> RangeCursor {
        let id = self.next_cursor_id;
        self.next_cursor_id += 1;
        RangeCursor {
            id,
            range,
            continuation,
            page_token: None,
            skip,
            consumed: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    pub(crate) fn position(&self, cursor_id: u64) -> Option<usize> {
        self.cursors.iter().position(|c| c.id == cursor_id)
    }

    /// Replaces a gone range with its successors, each resuming from the gone
    /// range's continuation. Returns the number of successors.
    ///
    /// Only cursors with an empty buffer are ever fetched, so nothing buffered is lost.
    pub(crate) fn split(&mut self, index: usize, successors: Vec<PartitionKeyRange>) -> usize {
        let gone = self.cursors.remove(index);
        let count = successors.len();
        for (offset, range) in successors.into_iter().enumerate() {
            let cursor = self.new_cursor(range, gone.continuation.clone(), 0);
            self.cursors.insert(index + offset, cursor);
        }
        count
    }

    /// Moves a change-feed cursor to the etag of its latest poll.
    pub(crate) fn advance_etag(&mut self, index: usize, etag: Option<String>) {
        if let Some(etag) = etag {
            self.cursors[index].continuation = Some(etag);
        }
    }

    /// Returns whether every cursor is drained and nothing is pending.
    pub(crate) fn is_drained(&self) -> bool {
        self.ready.is_empty() && self.cursors.iter().all(RangeCursor::is_drained)
    }

    /// Pushes the buffered head of a cursor onto the merge heap.
    pub(crate) fn push_head(&mut self, index: usize, order_by: &Arc<[OrderByItem]>) {
        let cursor = &self.cursors[index];
        if let Some(front) = cursor.buffer.front() {
            self.heap.push(MergeHead {
                key: sort_key(front, order_by),
                min_inclusive: cursor.range.min_inclusive.clone(),
                cursor_id: cursor.id,
                order_by: order_by.clone(),
            });
        }
    }

    /// Moves the globally-first head item into the ready buffer.
    ///
    /// Returns `false` when the heap is empty.
    pub(crate) fn merge_step(&mut self, order_by: &Arc<[OrderByItem]>) -> bool {
        let Some(head) = self.heap.pop() else {
            return false;
        };
        let Some(index) = self.position(head.cursor_id) else {
            return true;
        };
        if let Some(item) = self.cursors[index].take_front() {
            self.ready.push_back(item);
        }
        self.push_head(index, order_by);
        true
    }

    /// Moves up to `limit` items from the first undrained cursor into the ready buffer.
    pub(crate) fn drain_front(&mut self, index: usize, limit: usize) {
        let cursor = &mut self.cursors[index];
        for _ in 0..limit {
            match cursor.take_front() {
                Some(item) => self.ready.push_back(item),
                None => break,
            }
        }
    }

    /// Takes up to `max` ready items for the caller.
    pub(crate) fn take_block(&mut self, max: usize) -> Vec<Document> {
        let n = max.min(self.ready.len());
        self.ready.drain(..n).collect()
    }

    /// Per-range resume points for every undrained cursor.
    pub(crate) fn resume_points(&self) -> Vec<RangeContinuation> {
        self.cursors.iter().filter_map(RangeCursor::resume_point).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str) -> Document {
        json!({ "id": id }).as_object().cloned().unwrap()
    }

    #[test]
    fn test_resume_point_tracks_consumed_items_of_buffered_page() {
        let mut state = IteratorState::default();
        state.add_cursor(PartitionKeyRange::new("0", "", "8000000000000000"), Some("t1".into()), 0);

        state.cursors[0].apply_page(vec![doc("a"), doc("b"), doc("c")], Some("t2".into()));
        state.drain_front(0, 1);

        let point = state.cursors[0].resume_point().unwrap();
        assert_eq!(point.token.as_deref(), Some("t1"));
        assert_eq!(point.skip, 1);
    }

    #[test]
    fn test_skip_drops_already_returned_items() {
        let mut state = IteratorState::default();
        state.add_cursor(PartitionKeyRange::new("0", "", "8000000000000000"), Some("t1".into()), 2);

        state.cursors[0].apply_page(vec![doc("a"), doc("b"), doc("c")], None);
        state.drain_front(0, 10);

        let ids: Vec<_> = state.ready.iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c")]);
        assert!(state.cursors[0].resume_point().is_none());
    }

    #[test]
    fn test_split_carries_continuation_to_every_successor() {
        let mut state = IteratorState::default();
        state.add_cursor(PartitionKeyRange::new("0", "", "8000000000000000"), Some("t".into()), 0);
        state.add_cursor(PartitionKeyRange::new("1", "8000000000000000", "FFFFFFFFFFFFFFFF"), None, 0);

        let count = state.split(
            0,
            vec![
                PartitionKeyRange::new("2", "", "4000000000000000"),
                PartitionKeyRange::new("3", "4000000000000000", "8000000000000000"),
            ],
        );

        assert_eq!(count, 2);
        let ids: Vec<&str> = state.cursors.iter().map(|c| c.range.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
        assert_eq!(state.cursors[0].continuation.as_deref(), Some("t"));
        assert_eq!(state.cursors[1].continuation.as_deref(), Some("t"));
    }
}
