//! Cache Entry Module
//!
//! Defines what a caller supplies for a new entry, the per-entry slot held
//! in the table, and the snapshot handed back on reads.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::arena::ObjectPointer;
use crate::expiration::ExpirationHint;
use crate::index::{AttrValue, Attributes};
use crate::lock::{EntryLock, LockAccessType, LockId, LockOptions};

// == Entry Spec ==
/// Caller-supplied parameters for an insert.
///
/// Leaving both expiration fields unset picks up the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct EntrySpec {
    /// Absolute expiration time
    pub absolute: Option<DateTime<Utc>>,
    /// Sliding (idle) window; zero means no idle expiration
    pub sliding: Option<Duration>,
    /// Attribute values to index
    pub attributes: Attributes,
}

impl EntrySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absolute(mut self, at: DateTime<Utc>) -> Self {
        self.absolute = Some(at);
        self
    }

    pub fn sliding(mut self, window: Duration) -> Self {
        self.sliding = Some(window);
        self
    }

    /// Opts out of the configured defaults; the entry never expires.
    pub fn no_expiration(mut self) -> Self {
        self.absolute = None;
        self.sliding = Some(Duration::zero());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

// == Access Options ==
/// Lock behavior of a read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub access: LockAccessType,
    pub lock_id: Option<LockId>,
}

impl ReadOptions {
    /// Read and take the lock under `lock_id`.
    pub fn acquire(lock_id: impl Into<LockId>) -> Self {
        Self {
            access: LockAccessType::Acquire,
            lock_id: Some(lock_id.into()),
        }
    }

    /// Read on a locked entry whoever holds it. The returned item carries
    /// the holder for the caller to compare against `lock_id`.
    pub fn comparing(lock_id: impl Into<LockId>) -> Self {
        Self {
            access: LockAccessType::CompareVersion,
            lock_id: Some(lock_id.into()),
        }
    }

    /// Read only if `lock_id` holds the lock.
    pub fn matching(lock_id: impl Into<LockId>) -> Self {
        Self {
            access: LockAccessType::MatchVersion,
            lock_id: Some(lock_id.into()),
        }
    }
}

/// Lock behavior of a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub access: LockAccessType,
    pub lock_id: Option<LockId>,
}

impl WriteOptions {
    /// Write as the lock holder and keep the lock.
    pub fn holding(lock_id: impl Into<LockId>) -> Self {
        Self {
            access: LockAccessType::DontRelease,
            lock_id: Some(lock_id.into()),
        }
    }

    /// Write as the lock holder, then release.
    pub fn releasing(lock_id: impl Into<LockId>) -> Self {
        Self {
            access: LockAccessType::Release,
            lock_id: Some(lock_id.into()),
        }
    }

    /// Take the lock, write, and keep it.
    pub fn acquire(lock_id: impl Into<LockId>) -> Self {
        Self {
            access: LockAccessType::Acquire,
            lock_id: Some(lock_id.into()),
        }
    }

    /// Write whoever holds the lock.
    pub fn ignore_lock() -> Self {
        Self {
            access: LockAccessType::IgnoreLock,
            lock_id: None,
        }
    }
}

// == Entry Slot ==
/// Table cell for one key. `state` is the per-entry mutual-exclusion scope;
/// `lock` is the caller-visible pessimistic lock.
#[derive(Debug)]
pub(crate) struct EntrySlot {
    pub(crate) lock: EntryLock,
    pub(crate) state: Mutex<EntryState>,
}

#[derive(Debug)]
pub(crate) struct EntryState {
    pub(crate) pointer: ObjectPointer,
    pub(crate) hint: Option<ExpirationHint>,
    pub(crate) attributes: Attributes,
    pub(crate) created_at: DateTime<Utc>,
    /// Set once the slot has left the table
    pub(crate) removed: bool,
}

impl EntrySlot {
    pub(crate) fn new(state: EntryState) -> Self {
        Self {
            lock: EntryLock::new(),
            state: Mutex::new(state),
        }
    }
}

impl EntryState {
    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.hint.as_ref().is_some_and(|hint| hint.is_expired(now))
    }
}

// == Cache Item ==
/// A successful read: the payload plus a metadata snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheItem {
    pub key: String,
    #[serde(skip)]
    pub value: Vec<u8>,
    pub attributes: Attributes,
    pub created_at: DateTime<Utc>,
    /// When the entry lapses if left untouched; `None` never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub lock: Option<LockOptions>,
}
