//! Cache Module
//!
//! The entry-management core: expiring, lockable, attribute-indexed entries
//! whose payloads live in the memory-mapped backing store.

mod entry;
mod stats;
mod store;


// Re-export public types
pub use entry::{CacheItem, EntrySpec, ReadOptions, WriteOptions};
pub use stats::CacheStats;
pub use store::Cache;

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;
