//! Cache Statistics Module
//!
//! Counters for read outcomes, expirations, lock contention and compaction,
//! plus gauges the cache fills in when a snapshot is taken.

use serde::Serialize;

use crate::error::CacheError;

// == Cache Stats ==
/// Counters accumulated by a [`Cache`](super::Cache).
///
/// `total_entries` and `arena_used` are gauges and are only meaningful on a
/// snapshot returned by `Cache::stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads that returned a payload
    pub hits: u64,
    /// Reads of a missing or lapsed key
    pub misses: u64,
    /// Entries removed because their hint lapsed
    pub expirations: u64,
    /// Acquisitions refused or timed out
    pub lock_failures: u64,
    /// Compactions that relocated at least one payload
    pub compactions: u64,
    pub total_entries: usize,
    /// Bytes reserved in the backing store
    pub arena_used: usize,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of reads that were hits, 0.0 before the first read.
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            reads => self.hits as f64 / reads as f64,
        }
    }

    /// Classifies a read result. Errors other than a missing or lapsed key
    /// (lock conflicts, bad requests) are not reads and are not counted.
    pub fn record_read<T>(&mut self, outcome: &Result<T, CacheError>) {
        match outcome {
            Ok(_) => self.record_hit(),
            Err(CacheError::NotFound(_)) | Err(CacheError::Expired(_)) => self.record_miss(),
            Err(_) => {}
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_expiration(&mut self) {
        self.expirations += 1;
    }

    pub fn record_lock_failure(&mut self) {
        self.lock_failures += 1;
    }

    pub fn record_compaction(&mut self) {
        self.compactions += 1;
    }
}
