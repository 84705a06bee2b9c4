//! Arena Module
//!
//! Backing store addressing: payload bytes live in memory-mapped views and
//! entries hold only [`ObjectPointer`]s into them. Compaction relocates
//! payloads and invalidates outstanding pointers until they are refreshed.

mod pointer;
mod store;
mod view;

pub use pointer::ObjectPointer;
pub use store::{ArenaStats, BackingStore, CompactionReport};
pub use view::{MemView, ViewStats, AREA_ALIGN};
