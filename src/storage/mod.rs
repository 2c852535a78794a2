//! Storage and persistence layer
//!
//! This module handles revision persistence: the row-oriented backing store,
//! prepared statement caching, list table mapping and lazy chunk loading.

pub mod accessor;
pub mod backend;
pub mod chunk;
pub mod list_mapping;
pub mod statement;
pub mod store;

// Re-export main storage types
pub use accessor::{StoreAccessor, StoreChunkReader};
pub use backend::{ListKey, ListRow, MemoryRowStore, RowFilter, RowStore};
pub use chunk::Chunk;
pub use list_mapping::{ListTableMapping, UNCHUNKED};
pub use statement::{ReuseProbability, StatementCache, StatementGuard};
pub use store::Store;
