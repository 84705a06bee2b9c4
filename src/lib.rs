//! objcache - entry-management core for an in-process object cache
//!
//! Provides expiring, lockable, attribute-indexed entries whose payloads
//! live in memory-mapped views.

pub mod arena;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod expiration;
pub mod index;
pub mod lock;
pub mod query;
pub mod tasks;

pub use cache::{Cache, CacheItem, CacheStats, EntrySpec, ReadOptions, WriteOptions};
pub use config::{apply_defaults, Config};
pub use error::{CacheError, Result};
pub use tasks::spawn_cleanup_task;
