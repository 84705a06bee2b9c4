//! Configuration Module
//!
//! Handles loading startup defaults from environment variables and applying
//! them to newly inserted entries.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::EntrySpec;
use crate::error::{CacheError, Result};
use crate::expiration::{ExpirationHint, MAX_SLIDING_WINDOW_SECS};
use crate::index::AttrType;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Expiration applied to entries inserted without explicit parameters
    pub expiration: ExpirationDefaults,
    /// Lock wait and stale-lock policy
    pub lock: LockPolicy,
    /// Backing store geometry
    pub arena: ArenaConfig,
    /// Background cleanup task interval in seconds
    pub cleanup_interval: u64,
    /// Attributes indexed from startup
    pub indexed_attributes: Vec<IndexDefinition>,
}

/// Default expiration parameters. `None` disables that clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationDefaults {
    /// Absolute lifetime in seconds, counted from insertion
    pub absolute_secs: Option<u64>,
    /// Sliding window in seconds
    pub sliding_secs: Option<u64>,
}

/// How lock acquisition behaves when the entry is already locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Fail immediately with `AlreadyLocked`
    FailFast,
    /// Wait up to `timeout_ms`, then fail with `AcquireTimedOut`
    Block {
        /// Maximum wait in milliseconds
        timeout_ms: u64,
    },
}

/// Lock behavior handed to the lock controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    pub wait: WaitPolicy,
    /// Locks held this long are force-released by the sweep
    pub max_lock_age_secs: Option<u64>,
}

impl LockPolicy {
    /// An age too large to represent never makes a lock stale.
    pub fn max_lock_age(&self) -> Option<Duration> {
        self.max_lock_age_secs.and_then(secs_to_duration)
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            wait: WaitPolicy::FailFast,
            max_lock_age_secs: None,
        }
    }
}

/// Backing store geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Bytes per mapped view
    pub view_size: usize,
    /// Number of views
    pub view_count: usize,
    /// Directory for file-backed views; anonymous mappings when `None`
    pub path: Option<PathBuf>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            view_size: 1024 * 1024,
            view_count: 4,
            path: None,
        }
    }
}

/// An attribute indexed from startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub attr_type: AttrType,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `DEFAULT_ABSOLUTE_SECS` - Absolute lifetime, 0 disables (default: 0)
    /// - `DEFAULT_SLIDING_SECS` - Sliding window, 0 disables (default: 300)
    /// - `LOCK_WAIT_TIMEOUT_MS` - Blocking lock wait, 0 fails fast (default: 0)
    /// - `LOCK_MAX_AGE_SECS` - Stale lock age, 0 disables (default: 0)
    /// - `CLEANUP_INTERVAL` - Cleanup frequency in seconds (default: 1)
    /// - `ARENA_VIEW_SIZE` - Bytes per view (default: 1048576)
    /// - `ARENA_VIEW_COUNT` - Number of views (default: 4)
    /// - `ARENA_PATH` - Directory for file-backed views (default: anonymous)
    /// - `INDEXED_ATTRIBUTES` - `name:type` pairs, comma separated (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeout_ms: u64 = env_or("LOCK_WAIT_TIMEOUT_MS", 0);

        Self {
            expiration: ExpirationDefaults {
                absolute_secs: env_secs("DEFAULT_ABSOLUTE_SECS", 0, MAX_DURATION_SECS),
                sliding_secs: env_secs("DEFAULT_SLIDING_SECS", 300, MAX_SLIDING_WINDOW_SECS as u64 - 1),
            },
            lock: LockPolicy {
                wait: if timeout_ms == 0 {
                    WaitPolicy::FailFast
                } else {
                    WaitPolicy::Block { timeout_ms }
                },
                max_lock_age_secs: env_secs("LOCK_MAX_AGE_SECS", 0, MAX_DURATION_SECS),
            },
            arena: ArenaConfig {
                view_size: env_or("ARENA_VIEW_SIZE", defaults.arena.view_size),
                view_count: env_or("ARENA_VIEW_COUNT", defaults.arena.view_count),
                path: env::var("ARENA_PATH").ok().map(PathBuf::from),
            },
            cleanup_interval: env_or("CLEANUP_INTERVAL", defaults.cleanup_interval),
            indexed_attributes: env::var("INDEXED_ATTRIBUTES")
                .map(|v| parse_index_definitions(&v))
                .unwrap_or_default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            expiration: ExpirationDefaults {
                absolute_secs: None,
                sliding_secs: Some(300),
            },
            lock: LockPolicy::default(),
            arena: ArenaConfig::default(),
            cleanup_interval: 1,
            indexed_attributes: Vec::new(),
        }
    }
}

// == Apply Defaults ==
/// Resolves the expiration hint and lock policy for a new entry.
///
/// Caller-supplied parameters win. Only when the caller supplied neither an
/// absolute time nor a sliding window are the configured defaults used, so an
/// explicit zero window still means "never expires".
///
/// A default lifetime that reaches past the last representable instant
/// means no absolute deadline.
///
/// # Errors
/// `InvalidExpirationWindow` if the resulting sliding window is out of range.
pub fn apply_defaults(
    spec: &EntrySpec,
    config: &Config,
    now: DateTime<Utc>,
) -> Result<(Option<ExpirationHint>, LockPolicy)> {
    let (absolute, sliding) = if spec.absolute.is_none() && spec.sliding.is_none() {
        let absolute = config
            .expiration
            .absolute_secs
            .and_then(secs_to_duration)
            .and_then(|lifetime| now.checked_add_signed(lifetime));
        let sliding = match config.expiration.sliding_secs {
            Some(secs) => Some(secs_to_duration(secs).ok_or_else(|| {
                CacheError::InvalidExpirationWindow(format!(
                    "default sliding window of {}s is out of range",
                    secs
                ))
            })?),
            None => None,
        };
        (absolute, sliding)
    } else {
        (spec.absolute, spec.sliding)
    };

    let hint = ExpirationHint::from_params(absolute, sliding, now)?;
    Ok((hint, config.lock.clone()))
}

// == Helpers ==
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn non_zero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

/// Largest whole-second count a `Duration` can hold.
const MAX_DURATION_SECS: u64 = (i64::MAX / 1_000) as u64;

/// Reads a seconds setting where 0 disables it. Values above `max` fall
/// back to `default`.
fn env_secs(name: &str, default: u64, max: u64) -> Option<u64> {
    let secs = env_or(name, default);
    if secs > max {
        warn!("{}={} is out of range, using {}", name, secs, default);
        return non_zero(default);
    }
    non_zero(secs)
}

fn secs_to_duration(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

fn parse_index_definitions(raw: &str) -> Vec<IndexDefinition> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| {
            let parsed = item
                .split_once(':')
                .and_then(|(name, ty)| Some((name.trim(), ty.trim().parse::<AttrType>().ok()?)));
            match parsed {
                Some((name, attr_type)) if !name.is_empty() => Some(IndexDefinition {
                    name: name.to_string(),
                    attr_type,
                }),
                _ => {
                    warn!("Ignoring malformed index definition '{}'", item);
                    None
                }
            }
        })
        .collect()
}
