//! Lock Module
//!
//! Pessimistic per-entry locking with an explicit access-mode vocabulary.

mod controller;
mod options;

pub use controller::{EntryLock, LockController};
pub use options::{LockAccessType, LockId, LockOptions};
