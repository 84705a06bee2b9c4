//! Background Tasks Module
//!
//! Contains background tasks that run periodically while the cache is up.
//!
//! # Tasks
//! - Expiration sweep: removes lapsed entries and stale locks at the
//!   configured interval

mod cleanup;

pub use cleanup::spawn_cleanup_task;
