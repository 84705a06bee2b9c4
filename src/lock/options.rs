//! Lock Options Module
//!
//! Lock metadata and the access-mode vocabulary.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// == Lock Access Type ==
/// Governs whether an operation takes, inspects, releases or ignores an
/// entry's lock. Exactly one mode applies per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAccessType {
    /// Take the lock as part of the operation
    Acquire,
    /// Read without taking the lock
    DontAcquire,
    /// Release the lock once the operation succeeds
    Release,
    /// Keep the lock held after the operation
    DontRelease,
    /// Bypass the lock entirely (administrative)
    IgnoreLock,
    /// Report the holder so the caller can compare it with its own id
    CompareVersion,
    /// Read the current lock metadata
    GetVersion,
    /// Require the presented lock id to match the holder
    MatchVersion,
    /// Mutate without disturbing lock metadata
    PreserveVersion,
    /// Respect the lock without touching it
    #[default]
    Default,
}

impl LockAccessType {
    /// Returns true for the modes that only read lock metadata.
    pub fn is_inspection(self) -> bool {
        matches!(
            self,
            LockAccessType::CompareVersion
                | LockAccessType::GetVersion
                | LockAccessType::MatchVersion
        )
    }
}

// == Lock Id ==
/// Opaque caller-chosen lock token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// == Lock Options ==
/// Metadata of an outstanding lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOptions {
    /// Holder's token
    pub lock_id: LockId,
    /// When the lock was acquired or last refreshed
    pub lock_date: DateTime<Utc>,
}

impl LockOptions {
    pub fn new(lock_id: LockId, lock_date: DateTime<Utc>) -> Self {
        Self { lock_id, lock_date }
    }

    /// How long the lock has been held at `now`, saturating at zero.
    pub fn lock_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.lock_date).max(Duration::zero())
    }

    pub fn is_held_by(&self, lock_id: &LockId) -> bool {
        &self.lock_id == lock_id
    }
}
