//! Integration Tests for the Cache Core
//!
//! Drives the public API end to end: expiration, locking, indexed queries
//! and payload addressing through compaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Duration;
use objcache::arena::BackingStore;
use objcache::clock::ManualClock;
use objcache::config::{ArenaConfig, IndexDefinition, WaitPolicy};
use objcache::events::{ChannelListener, EventKind, NoopListener};
use objcache::index::AttrType;
use objcache::lock::LockId;
use objcache::query::{Expr, OrderBy, Page, QueryParams};
use objcache::{spawn_cleanup_task, Cache, CacheError, Config, EntrySpec, WriteOptions};
use tokio_test::{assert_err, assert_ok};

// == Helper Functions ==

fn test_config() -> Config {
    Config {
        arena: ArenaConfig {
            view_size: 16 * 1024,
            view_count: 2,
            path: None,
        },
        indexed_attributes: vec![
            IndexDefinition {
                name: "color".to_string(),
                attr_type: AttrType::Str,
            },
            IndexDefinition {
                name: "size".to_string(),
                attr_type: AttrType::Int,
            },
        ],
        ..Config::default()
    }
}

fn manual_cache() -> (Arc<Cache>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let cache = Cache::with_clock(test_config(), clock.clone(), Arc::new(NoopListener)).unwrap();
    (Arc::new(cache), clock)
}

// == Expiration ==

#[test]
fn test_idle_entry_five_second_window() {
    let (cache, clock) = manual_cache();
    cache
        .insert("session", b"data", EntrySpec::new().sliding(Duration::seconds(5)))
        .unwrap();

    clock.advance(Duration::seconds(4));
    assert!(cache.contains_key("session"));

    clock.advance(Duration::seconds(2));
    assert!(!cache.contains_key("session"));
    assert!(matches!(cache.get("session"), Err(CacheError::Expired(_))));
}

#[test]
fn test_fixed_and_idle_must_both_lapse() {
    let (cache, clock) = manual_cache();
    let start = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
    cache
        .insert(
            "k",
            b"v",
            EntrySpec::new()
                .absolute(start + Duration::seconds(10))
                .sliding(Duration::seconds(3)),
        )
        .unwrap();

    // idle lapsed, fixed not yet
    clock.advance(Duration::seconds(5));
    assert!(cache.contains_key("k"));

    // keep touching past the fixed deadline
    for _ in 0..4 {
        clock.advance(Duration::seconds(2));
        assert_ok!(cache.get("k"));
    }

    clock.advance(Duration::seconds(3));
    assert_err!(cache.get("k"));
}

#[test]
fn test_expiration_event_is_delivered() {
    let clock = Arc::new(ManualClock::default());
    let (listener, mut rx) = ChannelListener::new();
    let cache = Cache::with_clock(test_config(), clock.clone(), Arc::new(listener)).unwrap();

    cache
        .insert("a", b"1", EntrySpec::new().sliding(Duration::seconds(1)))
        .unwrap();
    cache
        .insert("b", b"2", EntrySpec::new().no_expiration())
        .unwrap();
    clock.advance(Duration::seconds(2));

    assert_eq!(cache.cleanup_expired(), 1);
    let event = rx.try_recv().unwrap();
    assert_eq!(event.key, "a");
    assert_eq!(event.kind, EventKind::Expired);
    assert!(rx.try_recv().is_err());
}

// == Locking ==

#[test]
fn test_two_threads_acquire_one_wins() {
    let (cache, _) = manual_cache();
    cache.insert("shared", b"v", EntrySpec::new()).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|id| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                cache.lock("shared", &LockId::new(id))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let already_locked = results
        .iter()
        .filter(|r| matches!(r, Err(CacheError::AlreadyLocked { .. })))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(already_locked, 1);
    assert_eq!(cache.stats().lock_failures, 1);
}

#[test]
fn test_blocked_acquirer_wakes_on_release() {
    let clock = Arc::new(ManualClock::default());
    let mut config = test_config();
    config.lock.wait = WaitPolicy::Block { timeout_ms: 5_000 };
    let cache = Arc::new(Cache::with_clock(config, clock, Arc::new(NoopListener)).unwrap());

    cache.insert("k", b"v", EntrySpec::new()).unwrap();
    cache.lock("k", &LockId::new("first")).unwrap();

    let waiter = {
        let cache = cache.clone();
        thread::spawn(move || cache.lock("k", &LockId::new("second")))
    };

    thread::sleep(std::time::Duration::from_millis(50));
    cache.unlock("k", &LockId::new("first")).unwrap();

    let options = waiter.join().unwrap().unwrap();
    assert_eq!(options.lock_id, LockId::new("second"));
}

#[test]
fn test_holder_write_flow() {
    let (cache, _) = manual_cache();
    cache.insert("doc", b"v1", EntrySpec::new()).unwrap();
    cache.lock("doc", &LockId::new("editor")).unwrap();

    assert!(matches!(
        cache.insert("doc", b"intruder", EntrySpec::new()),
        Err(CacheError::AlreadyLocked { .. })
    ));
    cache
        .insert_with("doc", b"v2", EntrySpec::new(), &WriteOptions::holding("editor"))
        .unwrap();
    assert!(cache.lock_info("doc").unwrap().is_some());

    cache
        .insert_with("doc", b"v3", EntrySpec::new(), &WriteOptions::releasing("editor"))
        .unwrap();
    assert!(cache.lock_info("doc").unwrap().is_none());
    assert_eq!(cache.get("doc").unwrap(), b"v3");
}

// == Queries ==

#[test]
fn test_color_index_red_red_blue() {
    let (cache, _) = manual_cache();
    cache
        .insert("k2", b"v", EntrySpec::new().attribute("color", "red"))
        .unwrap();
    cache
        .insert("k3", b"v", EntrySpec::new().attribute("color", "blue"))
        .unwrap();
    cache
        .insert("k1", b"v", EntrySpec::new().attribute("color", "red"))
        .unwrap();

    let red = Expr::member("color").equals(Expr::constant("red"));
    let mut keys = cache.query(&red, &QueryParams::new()).unwrap();
    keys.sort();
    assert_eq!(keys, vec!["k1", "k2"]);
}

#[test]
fn test_paged_query_with_parameters() {
    let (cache, _) = manual_cache();
    for (key, size) in [("a", 4), ("b", 9), ("c", 1), ("d", 7), ("e", 9)] {
        cache
            .insert(key, b"v", EntrySpec::new().attribute("size", size))
            .unwrap();
    }

    let expr = Expr::member("size").at_least(Expr::param("min"));
    let params = QueryParams::new().with("min", 4);
    let order = OrderBy::descending("size");

    let first = cache
        .query_page(&expr, &params, &order, Page::new(0, 2))
        .unwrap();
    let second = cache
        .query_page(&expr, &params, &order, Page::new(2, 2))
        .unwrap();
    assert_eq!(first, vec!["b", "e"]);
    assert_eq!(second, vec!["d", "a"]);

    assert!(matches!(
        cache.query(&expr, &QueryParams::new()),
        Err(CacheError::InvalidPredicate(_))
    ));
}

#[test]
fn test_malformed_predicates_fail_early() {
    let (cache, _) = manual_cache();
    let unindexed = Expr::member("weight").equals(Expr::constant(1));
    assert!(matches!(
        cache.compile(&unindexed),
        Err(CacheError::InvalidPredicate(_))
    ));

    let like_on_int = Expr::member("size").like("1*");
    assert!(cache.compile(&like_on_int).is_err());

    let empty = cache.compile(&Expr::or(vec![])).unwrap();
    assert!(empty.is_always_false());
}

// == Backing Store ==

#[test]
fn test_arena_round_trip_through_compaction() {
    let store = BackingStore::new(&ArenaConfig {
        view_size: 256,
        view_count: 1,
        path: None,
    })
    .unwrap();

    let gap = store.store(&[0xAA; 40]).unwrap();
    let ptr = store.allocate(11).unwrap();
    store.resolve(&ptr).unwrap().copy_from_slice(b"hello world");
    assert_eq!(&*store.resolve(&ptr).unwrap(), b"hello world");

    store.release(&gap).unwrap();
    assert!(matches!(store.read(&gap), Err(CacheError::StalePointer(_))));

    let report = store.compact();
    assert_eq!(report.relocated, 1);
    assert!(matches!(store.read(&ptr), Err(CacheError::StalePointer(_))));

    let ptr = store.refresh(&ptr).unwrap();
    assert_eq!(store.read(&ptr).unwrap(), b"hello world");
}

#[test]
fn test_file_backed_cache() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.arena.path = Some(dir.path().join("views"));

    let cache = Cache::new(config).unwrap();
    cache
        .insert("persisted", b"bytes on a mapped file", EntrySpec::new())
        .unwrap();
    assert_eq!(cache.get("persisted").unwrap(), b"bytes on a mapped file");
    assert!(dir.path().join("views").join("view-0.bin").exists());
}

#[test]
fn test_concurrent_writers_on_distinct_keys() {
    let (cache, _) = manual_cache();
    thread::scope(|scope| {
        for worker in 0..4 {
            let cache = &cache;
            scope.spawn(move || {
                for i in 0..25 {
                    let key = format!("w{}-{}", worker, i);
                    cache
                        .insert(
                            &key,
                            key.as_bytes(),
                            EntrySpec::new().attribute("size", i as i64),
                        )
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(cache.len(), 100);
    let small = Expr::member("size").less_than(Expr::constant(5));
    assert_eq!(cache.query(&small, &QueryParams::new()).unwrap().len(), 20);
    assert_eq!(cache.get("w3-24").unwrap(), b"w3-24");
}

#[test]
fn test_inserts_racing_compaction() {
    let cache = Cache::new(test_config()).unwrap();
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let compactor = scope.spawn(|| {
            while !done.load(Ordering::Relaxed) {
                cache.compact();
            }
        });

        let writers: Vec<_> = (0..4)
            .map(|worker| {
                let cache = &cache;
                scope.spawn(move || {
                    for i in 0..200 {
                        let key = format!("w{}-{}", worker, i);
                        let value = vec![worker as u8; 1 + i % 40];
                        cache.insert(&key, &value, EntrySpec::new()).unwrap();
                        assert_eq!(cache.get(&key).unwrap(), value);
                        cache.remove(&key).unwrap();
                    }
                })
            })
            .collect();

        let writers_ok = writers.into_iter().all(|w| w.join().is_ok());
        done.store(true, Ordering::Relaxed);
        assert!(compactor.join().is_ok());
        assert!(writers_ok);
    });

    assert!(cache.is_empty());
    let arena = cache.arena_stats();
    assert_eq!(arena.used, 0);
    assert_eq!(arena.live_areas, 0);
}

// == Background Sweep ==

#[tokio::test]
async fn test_sweep_task_end_to_end() {
    let cache = Arc::new(Cache::new(test_config()).unwrap());
    cache
        .insert(
            "brief",
            b"v",
            EntrySpec::new().sliding(Duration::milliseconds(300)),
        )
        .unwrap();
    cache
        .insert("lasting", b"v", EntrySpec::new().no_expiration())
        .unwrap();

    let handle = spawn_cleanup_task(cache.clone(), 1);
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    handle.abort();

    assert_eq!(cache.len(), 1);
    assert!(cache.contains_key("lasting"));
}
