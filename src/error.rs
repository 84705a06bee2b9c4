//! Error types for the cache core
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

use crate::arena::ObjectPointer;

// == Cache Error Enum ==
/// Unified error type for the entry-management core.
///
/// Expiration, lock and index failures are returned to the immediate caller;
/// nothing inside the core retries on its own except the single
/// sweep-compact-retry on [`CacheError::OutOfArenaSpace`] during insert.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Key has expired
    #[error("Key expired: {0}")]
    Expired(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Sliding window is non-positive or exceeds the sanity bound
    #[error("Invalid expiration window: {0}")]
    InvalidExpirationWindow(String),

    /// Entry is locked by another holder
    #[error("Key '{key}' is locked by '{holder}'")]
    AlreadyLocked {
        /// Locked entry
        key: String,
        /// Current lock holder
        holder: String,
    },

    /// Supplied lock id does not match the current holder
    #[error("Lock id mismatch on key '{key}': held by '{holder}', not '{supplied}'")]
    LockIdMismatch {
        /// Locked entry
        key: String,
        /// Current lock holder
        holder: String,
        /// Lock id presented by the caller
        supplied: String,
    },

    /// Release or inspection of an entry that is not locked
    #[error("No lock held on key: {0}")]
    NoSuchLock(String),

    /// Blocking acquisition gave up after the caller's timeout
    #[error("Timed out after {waited_ms}ms acquiring lock on key '{key}'")]
    AcquireTimedOut {
        /// Contended entry
        key: String,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Malformed predicate tree or unbound query parameter
    #[error("Invalid predicate: {0}")]
    InvalidPredicate(String),

    /// Pointer refers to released or relocated storage
    #[error("Stale pointer: {0}")]
    StalePointer(ObjectPointer),

    /// No view has a contiguous run large enough for the payload
    #[error("Out of arena space: {requested} bytes requested")]
    OutOfArenaSpace {
        /// Payload size that could not be placed
        requested: usize,
    },

    /// Mapping or file failure in the backing store
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    // == Recoverable ==
    /// Returns true if the caller may recover by evicting and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::OutOfArenaSpace { .. })
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache core.
pub type Result<T> = std::result::Result<T, CacheError>;
