//! Expiration Sweep Task
//!
//! Background task that periodically removes lapsed entries and releases
//! locks held past the configured maximum age.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::Cache;

/// Starts the periodic expiration sweep on the current runtime.
///
/// Every `cleanup_interval_secs` (at least one second) the task removes
/// lapsed entries and force-releases locks older than the configured
/// maximum age. Sweeps take entry locks, so they run on the blocking pool.
///
/// # Arguments
/// * `cache` - the cache to sweep
/// * `cleanup_interval_secs` - pause between sweeps
///
/// # Returns
/// The task handle. The task never finishes on its own; abort it on shutdown.
///
/// ```ignore
/// let sweeper = spawn_cleanup_task(Arc::clone(&cache), config.cleanup_interval);
/// shutdown.await;
/// sweeper.abort();
/// ```
pub fn spawn_cleanup_task(cache: Arc<Cache>, cleanup_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(cleanup_interval_secs.max(1));

    tokio::spawn(async move {
        info!(
            "Starting expiration sweep with interval of {} seconds",
            cleanup_interval_secs
        );

        loop {
            tokio::time::sleep(interval).await;

            let sweep = cache.clone();
            let swept = tokio::task::spawn_blocking(move || {
                (sweep.cleanup_expired(), sweep.release_stale_locks())
            })
            .await;

            match swept {
                Ok((0, 0)) => debug!("Sweep: nothing to do"),
                Ok((expired, stale_locks)) => info!(
                    "Sweep: removed {} expired entries, released {} stale locks",
                    expired, stale_locks
                ),
                Err(e) => debug!("Sweep did not complete: {}", e),
            }
        }
    })
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntrySpec;
    use crate::config::{ArenaConfig, Config};
    use crate::lock::LockId;

    fn small_cache(max_lock_age_secs: Option<u64>) -> Arc<Cache> {
        let mut config = Config {
            arena: ArenaConfig {
                view_size: 4096,
                view_count: 1,
                path: None,
            },
            ..Config::default()
        };
        config.lock.max_lock_age_secs = max_lock_age_secs;
        Arc::new(Cache::new(config).unwrap())
    }

    async fn run_sweeps_for(cache: &Arc<Cache>, millis: u64) {
        let sweeper = spawn_cleanup_task(cache.clone(), 1);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_lapsed_idle_entry_is_swept() {
        let cache = small_cache(None);
        cache
            .insert(
                "brief",
                b"value",
                EntrySpec::new().sliding(chrono::Duration::milliseconds(500)),
            )
            .unwrap();

        run_sweeps_for(&cache, 1500).await;

        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
        // removed by the sweep, so a later read is a plain miss
        assert!(!cache.contains_key("brief"));
    }

    #[tokio::test]
    async fn test_sweep_leaves_live_entries() {
        let cache = small_cache(None);
        cache
            .insert(
                "hour",
                b"value",
                EntrySpec::new().sliding(chrono::Duration::hours(1)),
            )
            .unwrap();

        run_sweeps_for(&cache, 1500).await;

        assert_eq!(cache.get("hour").unwrap(), b"value");
        assert_eq!(cache.stats().expirations, 0);
    }

    #[tokio::test]
    async fn test_sweep_breaks_abandoned_locks() {
        let cache = small_cache(Some(1));
        cache
            .insert("k", b"v", EntrySpec::new().no_expiration())
            .unwrap();
        cache.lock("k", &LockId::new("forgotten")).unwrap();

        run_sweeps_for(&cache, 2500).await;

        assert!(cache.lock_info("k").unwrap().is_none());
        assert!(cache.contains_key("k"));
    }

    #[tokio::test]
    async fn test_aborted_sweeper_finishes() {
        let cache = small_cache(None);
        let sweeper = spawn_cleanup_task(cache, 1);
        sweeper.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sweeper.is_finished());
    }
}
