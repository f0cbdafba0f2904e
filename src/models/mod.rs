//! Data models shared by the query core, the transport seam and the emulator.

mod link;
mod options;
mod page;
mod partition_key;
mod plan;
mod range;

pub use link::*;
pub use options::*;
pub use page::*;
pub use partition_key::*;
pub use plan::*;
pub use range::*;

/// A document returned by a query or change feed read.
pub type Document = serde_json::Map<String, serde_json::Value>;
