//! Paginated query and change feed iteration over partition key ranges.

mod change_feed;
mod iterator;
pub mod order;
mod state;

pub use change_feed::ChangeFeedCursor;
pub use iterator::QueryIterator;
