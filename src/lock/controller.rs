//! Lock Controller Module
//!
//! Per-entry pessimistic lock state machine:
//! `Unlocked -> Locked(lock_id, lock_date) -> Unlocked`.
//!
//! Each entry owns an [`EntryLock`]; its mutex makes acquire and release
//! linearizable, and its condvar wakes blocked acquirers on release.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::Duration;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::{LockAccessType, LockId, LockOptions};
use crate::clock::Clock;
use crate::config::{LockPolicy, WaitPolicy};
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, EventKind, EventListener};

// == Entry Lock ==
/// Lock state owned by a single entry.
#[derive(Debug, Default)]
pub struct EntryLock {
    state: Mutex<Option<LockOptions>>,
    released: Condvar,
}

impl EntryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current lock metadata.
    pub fn current(&self) -> Option<LockOptions> {
        self.state.lock().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().is_some()
    }
}

// == Lock Controller ==
/// Applies the configured [`LockPolicy`] to entry locks and reports failed
/// acquisitions to the event listener.
pub struct LockController {
    policy: LockPolicy,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn EventListener>,
}

impl LockController {
    pub fn new(policy: LockPolicy, clock: Arc<dyn Clock>, listener: Arc<dyn EventListener>) -> Self {
        Self {
            policy,
            clock,
            listener,
        }
    }

    // == Try Acquire ==
    /// Attempts to take the lock without waiting.
    ///
    /// `Acquire` succeeds on an unlocked entry, or refreshes `lock_date` when
    /// the caller already holds it. `IgnoreLock` takes the lock over
    /// regardless of the current holder.
    ///
    /// # Errors
    /// - `AlreadyLocked` if another holder owns the lock
    /// - `InvalidRequest` for access types that do not acquire
    pub fn try_acquire(
        &self,
        key: &str,
        lock: &EntryLock,
        access: LockAccessType,
        lock_id: &LockId,
    ) -> Result<LockOptions> {
        let mut state = lock.state.lock();
        let result = self.acquire_locked(key, &mut state, access, lock_id);
        drop(state);

        if let Err(CacheError::AlreadyLocked { .. }) = &result {
            self.notify_failure(key);
        }
        result
    }

    fn acquire_locked(
        &self,
        key: &str,
        state: &mut Option<LockOptions>,
        access: LockAccessType,
        lock_id: &LockId,
    ) -> Result<LockOptions> {
        let now = self.clock.now();
        match access {
            LockAccessType::Acquire => match state.as_mut() {
                None => {
                    let options = LockOptions::new(lock_id.clone(), now);
                    *state = Some(options.clone());
                    debug!(key, lock_id = %lock_id, "Lock acquired");
                    Ok(options)
                }
                Some(held) if held.is_held_by(lock_id) => {
                    held.lock_date = now;
                    Ok(held.clone())
                }
                Some(held) => Err(CacheError::AlreadyLocked {
                    key: key.to_string(),
                    holder: held.lock_id.to_string(),
                }),
            },
            LockAccessType::IgnoreLock => {
                if let Some(previous) = state.as_ref() {
                    if !previous.is_held_by(lock_id) {
                        info!(key, from = %previous.lock_id, to = %lock_id, "Lock taken over");
                    }
                }
                let options = LockOptions::new(lock_id.clone(), now);
                *state = Some(options.clone());
                Ok(options)
            }
            other => Err(CacheError::InvalidRequest(format!(
                "access type {:?} does not acquire a lock",
                other
            ))),
        }
    }

    // == Acquire ==
    /// Acquires the lock following the configured wait policy.
    pub fn acquire(&self, key: &str, lock: &EntryLock, lock_id: &LockId) -> Result<LockOptions> {
        match self.policy.wait {
            WaitPolicy::FailFast => self.try_acquire(key, lock, LockAccessType::Acquire, lock_id),
            WaitPolicy::Block { timeout_ms } => {
                self.acquire_with_timeout(key, lock, lock_id, StdDuration::from_millis(timeout_ms))
            }
        }
    }

    // == Acquire With Timeout ==
    /// Blocks until the lock is free or `timeout` elapses.
    ///
    /// On timeout the lock state is left exactly as the waiter found it.
    ///
    /// # Errors
    /// `AcquireTimedOut` if another holder kept the lock for the whole timeout.
    pub fn acquire_with_timeout(
        &self,
        key: &str,
        lock: &EntryLock,
        lock_id: &LockId,
        timeout: StdDuration,
    ) -> Result<LockOptions> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = lock.state.lock();

        loop {
            match self.acquire_locked(key, &mut state, LockAccessType::Acquire, lock_id) {
                Err(CacheError::AlreadyLocked { .. }) => {}
                result => return result,
            }

            if lock.released.wait_until(&mut state, deadline).timed_out() {
                // One last look: a release may have raced the timeout.
                match self.acquire_locked(key, &mut state, LockAccessType::Acquire, lock_id) {
                    Err(CacheError::AlreadyLocked { .. }) => break,
                    result => return result,
                }
            }
        }
        drop(state);

        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(key, waited_ms, "Lock acquisition timed out");
        self.notify_failure(key);
        Err(CacheError::AcquireTimedOut {
            key: key.to_string(),
            waited_ms,
        })
    }

    // == Release ==
    /// Releases the lock if `lock_id` matches the holder.
    ///
    /// # Errors
    /// - `NoSuchLock` if the entry is unlocked
    /// - `LockIdMismatch` if another holder owns the lock
    pub fn release(&self, key: &str, lock: &EntryLock, lock_id: &LockId) -> Result<()> {
        let mut state = lock.state.lock();
        match state.as_ref() {
            None => Err(CacheError::NoSuchLock(key.to_string())),
            Some(held) if !held.is_held_by(lock_id) => Err(CacheError::LockIdMismatch {
                key: key.to_string(),
                holder: held.lock_id.to_string(),
                supplied: lock_id.to_string(),
            }),
            Some(_) => {
                *state = None;
                lock.released.notify_all();
                debug!(key, lock_id = %lock_id, "Lock released");
                Ok(())
            }
        }
    }

    /// Applies the release half of an access type.
    ///
    /// `Release` releases, `DontRelease` is a no-op, `IgnoreLock` forces the
    /// release whoever holds it.
    pub fn release_with(
        &self,
        key: &str,
        lock: &EntryLock,
        access: LockAccessType,
        lock_id: &LockId,
    ) -> Result<()> {
        match access {
            LockAccessType::Release => self.release(key, lock, lock_id),
            LockAccessType::DontRelease => Ok(()),
            LockAccessType::IgnoreLock => {
                self.force_release(key, lock);
                Ok(())
            }
            other => Err(CacheError::InvalidRequest(format!(
                "access type {:?} does not release a lock",
                other
            ))),
        }
    }

    // == Force Release ==
    /// Clears the lock regardless of holder, returning the previous metadata.
    pub fn force_release(&self, key: &str, lock: &EntryLock) -> Option<LockOptions> {
        let previous = lock.state.lock().take();
        if let Some(previous) = &previous {
            lock.released.notify_all();
            info!(key, lock_id = %previous.lock_id, "Lock forcibly released");
        }
        previous
    }

    /// Force-releases a lock held for at least `max_age`.
    pub fn release_if_older_than(
        &self,
        key: &str,
        lock: &EntryLock,
        max_age: Duration,
    ) -> Option<LockOptions> {
        let now = self.clock.now();
        let mut state = lock.state.lock();
        let stale = state
            .as_ref()
            .is_some_and(|held| held.lock_age(now) >= max_age);
        if !stale {
            return None;
        }
        let previous = state.take();
        lock.released.notify_all();
        drop(state);

        if let Some(previous) = &previous {
            info!(key, lock_id = %previous.lock_id, "Stale lock released");
        }
        previous
    }

    /// Checks that a `Release` write could release the lock afterwards, so
    /// a write that would fail to release is refused before it mutates
    /// anything. Other access types pass.
    ///
    /// # Errors
    /// - `InvalidRequest` if no lock id was supplied
    /// - `NoSuchLock` if the entry is unlocked
    /// - `LockIdMismatch` if another holder owns the lock
    pub fn check_release(
        &self,
        key: &str,
        lock: &EntryLock,
        access: LockAccessType,
        lock_id: Option<&LockId>,
    ) -> Result<()> {
        if access != LockAccessType::Release {
            return Ok(());
        }
        let lock_id = lock_id
            .ok_or_else(|| CacheError::InvalidRequest("Release requires a lock id".to_string()))?;
        match lock.current() {
            None => Err(CacheError::NoSuchLock(key.to_string())),
            Some(held) if !held.is_held_by(lock_id) => Err(CacheError::LockIdMismatch {
                key: key.to_string(),
                holder: held.lock_id.to_string(),
                supplied: lock_id.to_string(),
            }),
            Some(_) => Ok(()),
        }
    }

    // == Inspect ==
    /// Reads lock metadata without changing state.
    ///
    /// `GetVersion` returns the current holder. `CompareVersion` also
    /// returns the holder whoever it is, and the caller compares (see
    /// [`LockController::compare`]). `MatchVersion` fails unless `expected`
    /// is the holder.
    ///
    /// # Errors
    /// - `NoSuchLock` if the entry is unlocked
    /// - `LockIdMismatch` if `MatchVersion` and `expected` is not the holder
    /// - `InvalidRequest` for non-inspection access types or a missing id
    pub fn inspect(
        &self,
        key: &str,
        lock: &EntryLock,
        access: LockAccessType,
        expected: Option<&LockId>,
    ) -> Result<LockOptions> {
        if !access.is_inspection() {
            return Err(CacheError::InvalidRequest(format!(
                "access type {:?} does not inspect a lock",
                access
            )));
        }

        let held = lock
            .current()
            .ok_or_else(|| CacheError::NoSuchLock(key.to_string()))?;

        if access == LockAccessType::GetVersion {
            return Ok(held);
        }
        let expected = expected.ok_or_else(|| {
            CacheError::InvalidRequest(format!("{:?} requires a lock id", access))
        })?;
        if access == LockAccessType::MatchVersion && !held.is_held_by(expected) {
            return Err(CacheError::LockIdMismatch {
                key: key.to_string(),
                holder: held.lock_id.to_string(),
                supplied: expected.to_string(),
            });
        }
        Ok(held)
    }

    /// Whether `expected` currently holds the lock.
    ///
    /// # Errors
    /// `NoSuchLock` if the entry is unlocked.
    pub fn compare(&self, key: &str, lock: &EntryLock, expected: &LockId) -> Result<bool> {
        lock.current()
            .map(|held| held.is_held_by(expected))
            .ok_or_else(|| CacheError::NoSuchLock(key.to_string()))
    }

    // == Check Write ==
    /// Gate for mutating paths: passes on an unlocked entry, for the
    /// holder, or with `IgnoreLock`.
    ///
    /// # Errors
    /// `AlreadyLocked` if another holder owns the lock.
    pub fn check_write(
        &self,
        key: &str,
        lock: &EntryLock,
        access: LockAccessType,
        lock_id: Option<&LockId>,
    ) -> Result<()> {
        if access == LockAccessType::IgnoreLock {
            return Ok(());
        }
        match lock.current() {
            Some(held) if lock_id.map_or(true, |id| !held.is_held_by(id)) => {
                Err(CacheError::AlreadyLocked {
                    key: key.to_string(),
                    holder: held.lock_id.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn notify_failure(&self, key: &str) {
        self.listener.on_event(CacheEvent::new(
            key,
            EventKind::LockAcquireFailed,
            self.clock.now(),
        ));
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::NoopListener;
    use std::sync::Barrier;
    use std::thread;

    fn controller(wait: WaitPolicy) -> (LockController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let policy = LockPolicy {
            wait,
            max_lock_age_secs: None,
        };
        let controller = LockController::new(policy, clock.clone(), Arc::new(NoopListener));
        (controller, clock)
    }

    #[test]
    fn test_acquire_and_release() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let id = LockId::from("a");

        let options = ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();
        assert_eq!(options.lock_id, id);
        assert!(lock.is_locked());

        ctl.release("k", &lock, &id).unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_second_holder_is_rejected() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &LockId::from("a"))
            .unwrap();

        let result = ctl.try_acquire("k", &lock, LockAccessType::Acquire, &LockId::from("b"));
        assert!(matches!(result, Err(CacheError::AlreadyLocked { holder, .. }) if holder == "a"));
    }

    #[test]
    fn test_reentrant_acquire_refreshes_date() {
        let (ctl, clock) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let id = LockId::from("a");

        let first = ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();
        clock.advance(Duration::seconds(10));
        let second = ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();
        assert_eq!(second.lock_date - first.lock_date, Duration::seconds(10));
    }

    #[test]
    fn test_ignore_lock_takes_over() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &LockId::from("a"))
            .unwrap();

        let admin = LockId::from("admin");
        ctl.try_acquire("k", &lock, LockAccessType::IgnoreLock, &admin)
            .unwrap();
        assert_eq!(lock.current().unwrap().lock_id, admin);
    }

    #[test]
    fn test_release_failures() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let id = LockId::from("a");

        assert!(matches!(
            ctl.release("k", &lock, &id),
            Err(CacheError::NoSuchLock(_))
        ));

        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();
        assert!(matches!(
            ctl.release("k", &lock, &LockId::from("b")),
            Err(CacheError::LockIdMismatch { .. })
        ));
        assert!(lock.is_locked());
    }

    #[test]
    fn test_dont_release_is_noop() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let id = LockId::from("a");
        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();

        ctl.release_with("k", &lock, LockAccessType::DontRelease, &LockId::from("zzz"))
            .unwrap();
        assert!(lock.is_locked());

        ctl.release_with("k", &lock, LockAccessType::IgnoreLock, &LockId::from("zzz"))
            .unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_inspect_modes() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let id = LockId::from("a");

        assert!(matches!(
            ctl.inspect("k", &lock, LockAccessType::GetVersion, None),
            Err(CacheError::NoSuchLock(_))
        ));

        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();
        let got = ctl.inspect("k", &lock, LockAccessType::GetVersion, None).unwrap();
        assert_eq!(got.lock_id, id);

        assert!(ctl
            .inspect("k", &lock, LockAccessType::MatchVersion, Some(&id))
            .is_ok());
        assert!(matches!(
            ctl.inspect("k", &lock, LockAccessType::MatchVersion, Some(&LockId::from("b"))),
            Err(CacheError::LockIdMismatch { .. })
        ));
        let compared = ctl
            .inspect("k", &lock, LockAccessType::CompareVersion, Some(&LockId::from("b")))
            .unwrap();
        assert_eq!(compared.lock_id, id);
        assert!(matches!(
            ctl.inspect("k", &lock, LockAccessType::CompareVersion, None),
            Err(CacheError::InvalidRequest(_))
        ));
        assert!(matches!(
            ctl.inspect("k", &lock, LockAccessType::Acquire, None),
            Err(CacheError::InvalidRequest(_))
        ));
        assert!(lock.is_locked());
    }

    #[test]
    fn test_compare_reports_without_failing() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let id = LockId::from("a");

        assert!(matches!(
            ctl.compare("k", &lock, &id),
            Err(CacheError::NoSuchLock(_))
        ));
        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();
        assert!(ctl.compare("k", &lock, &id).unwrap());
        assert!(!ctl.compare("k", &lock, &LockId::from("b")).unwrap());
    }

    #[test]
    fn test_check_release_precondition() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let id = LockId::from("a");

        assert!(ctl
            .check_release("k", &lock, LockAccessType::DontRelease, None)
            .is_ok());
        assert!(matches!(
            ctl.check_release("k", &lock, LockAccessType::Release, Some(&id)),
            Err(CacheError::NoSuchLock(_))
        ));

        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();
        assert!(matches!(
            ctl.check_release("k", &lock, LockAccessType::Release, None),
            Err(CacheError::InvalidRequest(_))
        ));
        assert!(matches!(
            ctl.check_release("k", &lock, LockAccessType::Release, Some(&LockId::from("b"))),
            Err(CacheError::LockIdMismatch { .. })
        ));
        assert!(ctl
            .check_release("k", &lock, LockAccessType::Release, Some(&id))
            .is_ok());
        // checking never releases
        assert!(lock.is_locked());
    }

    #[test]
    fn test_check_write_gate() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let id = LockId::from("a");

        assert!(ctl.check_write("k", &lock, LockAccessType::Default, None).is_ok());
        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &id).unwrap();

        assert!(ctl.check_write("k", &lock, LockAccessType::Default, None).is_err());
        assert!(ctl
            .check_write("k", &lock, LockAccessType::Default, Some(&id))
            .is_ok());
        assert!(ctl
            .check_write("k", &lock, LockAccessType::IgnoreLock, None)
            .is_ok());
    }

    #[test]
    fn test_stale_lock_release() {
        let (ctl, clock) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &LockId::from("a"))
            .unwrap();

        assert!(ctl
            .release_if_older_than("k", &lock, Duration::seconds(30))
            .is_none());
        clock.advance(Duration::seconds(30));
        assert!(ctl
            .release_if_older_than("k", &lock, Duration::seconds(30))
            .is_some());
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_timeout_leaves_state_unchanged() {
        let (ctl, _) = controller(WaitPolicy::Block { timeout_ms: 20 });
        let lock = EntryLock::new();
        let holder = LockId::from("a");
        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &holder)
            .unwrap();
        let before = lock.current();

        let result = ctl.acquire("k", &lock, &LockId::from("b"));
        assert!(matches!(result, Err(CacheError::AcquireTimedOut { .. })));
        assert_eq!(lock.current(), before);
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let (ctl, _) = controller(WaitPolicy::Block { timeout_ms: 5_000 });
        let lock = EntryLock::new();
        let first = LockId::from("a");
        ctl.try_acquire("k", &lock, LockAccessType::Acquire, &first)
            .unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| ctl.acquire("k", &lock, &LockId::from("b")));
            thread::sleep(StdDuration::from_millis(20));
            ctl.release("k", &lock, &first).unwrap();
            let acquired = waiter.join().unwrap().unwrap();
            assert_eq!(acquired.lock_id, LockId::from("b"));
        });
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let (ctl, _) = controller(WaitPolicy::FailFast);
        let lock = EntryLock::new();
        let threads = 8;
        let barrier = Barrier::new(threads);

        let results: Vec<Result<LockOptions>> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let ctl = &ctl;
                    let lock = &lock;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        ctl.try_acquire(
                            "k",
                            lock,
                            LockAccessType::Acquire,
                            &LockId::new(format!("t{}", i)),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(CacheError::AlreadyLocked { .. }))));
    }
}
