//! Expiration Module
//!
//! Time-based validity of cache entries. A hint is evaluated against an
//! explicit `now` and never mutates itself while doing so; only `touch`
//! (invoked once per successful read or write) moves an idle clock.

mod hint;

use serde::{Deserialize, Serialize};

pub use hint::{
    AggregateExpiration, ExpirationHint, FixedExpiration, FixedIdleExpiration, IdleExpiration,
};

// == Public Constants ==
/// Sliding windows must be strictly shorter than this many seconds (one year).
pub const MAX_SLIDING_WINDOW_SECS: i64 = 365 * 24 * 60 * 60;

// == Validity ==
/// Outcome of evaluating a hint at an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// The entry may still be served
    Valid,
    /// The entry has lapsed
    Expired,
}

impl Validity {
    fn from_expired(expired: bool) -> Self {
        if expired {
            Validity::Expired
        } else {
            Validity::Valid
        }
    }

    /// Returns true for [`Validity::Expired`].
    pub fn is_expired(self) -> bool {
        self == Validity::Expired
    }
}

// == Hint Type ==
/// Tag identifying a hint variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintType {
    /// Absolute deadline
    Fixed,
    /// Sliding window since last access
    Idle,
    /// Absolute deadline and sliding window, both must lapse
    FixedIdle,
    /// Ordered children, any lapse expires the entry
    Aggregate,
}
