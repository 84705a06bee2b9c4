//! Cache Store Module
//!
//! The cache core: a sharded entry table whose payloads live in the backing
//! store, with per-entry expiration, pessimistic locks and attribute
//! indexes.
//!
//! Lock order is shard table, then entry state, then everything else
//! (entry lock, index buckets, arena views). Nothing waits on a shard while
//! holding an entry state.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::entry::{EntrySlot, EntryState};
use super::{CacheItem, CacheStats, EntrySpec, ReadOptions, WriteOptions, MAX_KEY_LENGTH};
use crate::arena::{ArenaStats, BackingStore, CompactionReport, ObjectPointer};
use crate::clock::{Clock, SystemClock};
use crate::config::{apply_defaults, Config};
use crate::error::{CacheError, Result};
use crate::events::{CacheEvent, EventKind, EventListener, NoopListener};
use crate::expiration::ExpirationHint;
use crate::index::{AttrType, Attributes, IndexStore};
use crate::lock::{LockAccessType, LockController, LockId, LockOptions};
use crate::query::{compile, evaluate, order_keys, CompiledPredicate, Expr, OrderBy, Page, QueryParams};

/// Number of independently locked table shards.
const SHARD_COUNT: usize = 16;

type Shard = RwLock<HashMap<String, Arc<EntrySlot>>>;

// == Cache ==
/// Thread-safe object cache. Share it behind an `Arc`.
pub struct Cache {
    config: Config,
    shards: Vec<Shard>,
    arena: BackingStore,
    index: IndexStore,
    locks: LockController,
    clock: Arc<dyn Clock>,
    listener: Arc<dyn EventListener>,
    stats: Mutex<CacheStats>,
}

impl Cache {
    // == Constructors ==
    /// Creates a cache on the system clock that discards events.
    ///
    /// # Errors
    /// Fails if the backing store cannot be mapped or the configured
    /// indexes conflict.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock), Arc::new(NoopListener))
    }

    /// Creates a cache that reports events to `listener`.
    pub fn with_listener(config: Config, listener: Arc<dyn EventListener>) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock), listener)
    }

    /// Creates a cache with an explicit time source.
    pub fn with_clock(
        config: Config,
        clock: Arc<dyn Clock>,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self> {
        let arena = BackingStore::new(&config.arena)?;

        let index = IndexStore::new();
        for definition in &config.indexed_attributes {
            index.define(&definition.name, definition.attr_type)?;
        }

        let locks = LockController::new(config.lock.clone(), clock.clone(), listener.clone());
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();

        info!(
            "Cache ready: {} indexed attribute(s), lock wait {:?}",
            config.indexed_attributes.len(),
            config.lock.wait
        );

        Ok(Self {
            config,
            shards,
            arena,
            index,
            locks,
            clock,
            listener,
            stats: Mutex::new(CacheStats::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn shard(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    fn slot(&self, key: &str) -> Option<Arc<EntrySlot>> {
        self.shard(key).read().get(key).cloned()
    }

    fn require_slot(&self, key: &str) -> Result<Arc<EntrySlot>> {
        self.slot(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    fn snapshot(&self) -> Vec<(String, Arc<EntrySlot>)> {
        let mut slots = Vec::new();
        for shard in &self.shards {
            let table = shard.read();
            slots.extend(table.iter().map(|(key, slot)| (key.clone(), slot.clone())));
        }
        slots
    }

    // == Insert ==
    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    /// - `InvalidRequest` for a bad key or mistyped indexed attribute
    /// - `InvalidExpirationWindow` for a bad sliding window
    /// - `AlreadyLocked` if another holder locks the existing entry
    /// - `OutOfArenaSpace` if the payload does not fit even after a sweep
    ///   and compaction
    pub fn insert(&self, key: &str, value: &[u8], spec: EntrySpec) -> Result<()> {
        self.insert_with(key, value, spec, &WriteOptions::default())
    }

    /// Insert with explicit lock behavior.
    pub fn insert_with(
        &self,
        key: &str,
        value: &[u8],
        spec: EntrySpec,
        options: &WriteOptions,
    ) -> Result<()> {
        validate_key(key)?;
        let now = self.clock.now();
        let (hint, _) = apply_defaults(&spec, &self.config, now)?;
        let pointer = self.store_payload(value)?;

        // `place` fails only before the pointer is installed
        let result = self.place(key, pointer, hint, spec.attributes, options, now);
        if result.is_err() {
            self.release_payload(pointer);
        }
        result
    }

    fn place(
        &self,
        key: &str,
        pointer: ObjectPointer,
        hint: Option<ExpirationHint>,
        attributes: Attributes,
        options: &WriteOptions,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(slot) = self.slot(key) {
            if options.access == LockAccessType::Acquire {
                self.acquire_slot(key, &slot, require_lock_id(options.lock_id.as_ref())?)?;
            }
            let mut state = slot.state.lock();
            if !state.removed {
                return self.overwrite(key, &slot, &mut state, pointer, hint, attributes, options, now);
            }
        }

        let mut table = self.shard(key).write();
        if let Some(slot) = table.get(key).cloned() {
            // created by a concurrent insert since the lookup above
            if options.access == LockAccessType::Acquire {
                let lock_id = require_lock_id(options.lock_id.as_ref())?;
                self.try_acquire_slot(key, &slot, lock_id)?;
            }
            let mut state = slot.state.lock();
            return self.overwrite(key, &slot, &mut state, pointer, hint, attributes, options, now);
        }

        let acquire = match options.access {
            LockAccessType::Acquire => Some(require_lock_id(options.lock_id.as_ref())?),
            _ => None,
        };
        let slot = Arc::new(EntrySlot::new(EntryState {
            pointer,
            hint,
            attributes,
            created_at: now,
            removed: false,
        }));
        // a fresh entry has no lock to release
        self.locks
            .check_release(key, &slot.lock, options.access, options.lock_id.as_ref())?;
        self.index.add_entry(key, &slot.state.lock().attributes)?;
        if let Some(lock_id) = acquire {
            if let Err(e) = self.try_acquire_slot(key, &slot, lock_id) {
                self.index.remove_entry(key, &slot.state.lock().attributes);
                return Err(e);
            }
        }
        table.insert(key.to_string(), slot);
        debug!(key, "Entry inserted");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn overwrite(
        &self,
        key: &str,
        slot: &EntrySlot,
        state: &mut EntryState,
        pointer: ObjectPointer,
        hint: Option<ExpirationHint>,
        attributes: Attributes,
        options: &WriteOptions,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable(key, slot, options)?;
        self.index.update_entry(key, &state.attributes, &attributes)?;

        let previous = std::mem::replace(&mut state.pointer, pointer);
        state.hint = hint;
        state.attributes = attributes;
        state.created_at = now;
        self.release_payload(previous);

        self.finish_write(key, slot, options);
        debug!(key, "Entry overwritten");
        Ok(())
    }

    /// Every lock check a write needs, run before it mutates anything.
    fn check_writable(&self, key: &str, slot: &EntrySlot, options: &WriteOptions) -> Result<()> {
        let lock_id = options.lock_id.as_ref();
        self.locks
            .check_write(key, &slot.lock, options.access, lock_id)?;
        self.locks
            .check_release(key, &slot.lock, options.access, lock_id)
    }

    /// Releases the lock after a committed `Release` write. The write stands
    /// even if the lock was force-released in the meantime.
    fn finish_write(&self, key: &str, slot: &EntrySlot, options: &WriteOptions) {
        if options.access != LockAccessType::Release {
            return;
        }
        if let Some(lock_id) = options.lock_id.as_ref() {
            if let Err(e) = self.locks.release(key, &slot.lock, lock_id) {
                debug!(key, "Lock already gone after write: {}", e);
            }
        }
    }

    // == Get ==
    /// Returns a copy of the value stored under `key`.
    ///
    /// A successful read counts as an access for idle expiration.
    ///
    /// # Errors
    /// `NotFound` for an unknown key, `Expired` if the entry lapsed (it is
    /// removed as part of the call).
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        Ok(self.get_with(key, &ReadOptions::default())?.value)
    }

    /// Read with explicit lock behavior.
    ///
    /// `Acquire` takes the lock before reading, following the configured
    /// wait policy. `GetVersion` and `CompareVersion` require a lock and
    /// report its holder; `MatchVersion` also fails unless `lock_id` holds
    /// it. Other access types read regardless of the lock. Only a read that
    /// returns the payload counts as an access.
    pub fn get_with(&self, key: &str, options: &ReadOptions) -> Result<CacheItem> {
        let result = self.read_entry(key, options);
        self.stats.lock().record_read(&result);
        result
    }

    fn read_entry(&self, key: &str, options: &ReadOptions) -> Result<CacheItem> {
        let slot = self.require_slot(key)?;
        drop(self.live_state(key, &slot, self.clock.now())?);

        let lock = match options.access {
            LockAccessType::Acquire => {
                let lock_id = require_lock_id(options.lock_id.as_ref())?;
                Some(self.acquire_slot(key, &slot, lock_id)?)
            }
            access if access.is_inspection() => {
                Some(
                    self.locks
                        .inspect(key, &slot.lock, access, options.lock_id.as_ref())?,
                )
            }
            _ => slot.lock.current(),
        };

        let now = self.clock.now();
        let mut state = self.live_state(key, &slot, now)?;
        let value = self.read_payload(&mut state)?;
        if let Some(hint) = state.hint.as_mut() {
            hint.touch(now);
        }

        Ok(CacheItem {
            key: key.to_string(),
            value,
            attributes: state.attributes.clone(),
            created_at: state.created_at,
            expires_at: state.hint.as_ref().and_then(ExpirationHint::next_deadline),
            lock,
        })
    }

    /// Locks the entry state, failing if the entry is gone or has lapsed.
    /// A lapsed entry is expired on the spot.
    fn live_state<'a>(
        &self,
        key: &str,
        slot: &'a Arc<EntrySlot>,
        now: DateTime<Utc>,
    ) -> Result<MutexGuard<'a, EntryState>> {
        let state = slot.state.lock();
        if state.removed {
            return Err(CacheError::NotFound(key.to_string()));
        }
        if state.is_expired(now) {
            drop(state);
            self.expire(key, slot, now);
            return Err(CacheError::Expired(key.to_string()));
        }
        Ok(state)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.slot(key).is_some_and(|slot| {
            let state = slot.state.lock();
            !state.removed && !state.is_expired(now)
        })
    }

    // == Remove ==
    /// Removes `key`.
    ///
    /// # Errors
    /// `NotFound` for an unknown key, `AlreadyLocked` if another holder
    /// locks it.
    pub fn remove(&self, key: &str) -> Result<()> {
        self.remove_with(key, &WriteOptions::default())
    }

    pub fn remove_with(&self, key: &str, options: &WriteOptions) -> Result<()> {
        let mut table = self.shard(key).write();
        let slot = table
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
        let state = slot.state.lock();
        self.locks
            .check_write(key, &slot.lock, options.access, options.lock_id.as_ref())?;
        table.remove(key);
        drop(table);

        self.discard(key, &slot, state);
        debug!(key, "Entry removed");
        Ok(())
    }

    /// Releases everything an unlinked slot owns and wakes its lock waiters.
    fn discard(&self, key: &str, slot: &EntrySlot, mut state: MutexGuard<'_, EntryState>) {
        state.removed = true;
        self.index.remove_entry(key, &state.attributes);
        self.release_payload(state.pointer);
        drop(state);
        self.locks.force_release(key, &slot.lock);
    }

    fn expire(&self, key: &str, slot: &Arc<EntrySlot>, now: DateTime<Utc>) -> bool {
        let mut table = self.shard(key).write();
        if !table.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            return false;
        }
        let state = slot.state.lock();
        if state.removed || !state.is_expired(now) {
            return false;
        }
        table.remove(key);
        drop(table);

        self.discard(key, slot, state);
        self.stats.lock().record_expiration();
        self.listener
            .on_event(CacheEvent::new(key, EventKind::Expired, now));
        debug!(key, "Entry expired");
        true
    }

    // == Locking ==
    /// Locks `key` for `lock_id`, following the configured wait policy.
    ///
    /// # Errors
    /// `AlreadyLocked` (fail-fast) or `AcquireTimedOut` (blocking) if another
    /// holder keeps the lock.
    pub fn lock(&self, key: &str, lock_id: &LockId) -> Result<LockOptions> {
        let slot = self.require_slot(key)?;
        drop(self.live_state(key, &slot, self.clock.now())?);
        let options = self.acquire_slot(key, &slot, lock_id)?;
        self.ensure_still_linked(key, &slot)?;
        Ok(options)
    }

    /// Locks `key`, waiting at most `timeout` whatever the configured policy.
    pub fn lock_with_timeout(
        &self,
        key: &str,
        lock_id: &LockId,
        timeout: StdDuration,
    ) -> Result<LockOptions> {
        let slot = self.require_slot(key)?;
        drop(self.live_state(key, &slot, self.clock.now())?);
        let options = self
            .locks
            .acquire_with_timeout(key, &slot.lock, lock_id, timeout)
            .inspect_err(|e| self.record_lock_failure(e))?;
        self.ensure_still_linked(key, &slot)?;
        Ok(options)
    }

    fn ensure_still_linked(&self, key: &str, slot: &EntrySlot) -> Result<()> {
        if slot.state.lock().removed {
            // removed while we waited
            self.locks.force_release(key, &slot.lock);
            return Err(CacheError::NotFound(key.to_string()));
        }
        Ok(())
    }

    fn acquire_slot(&self, key: &str, slot: &EntrySlot, lock_id: &LockId) -> Result<LockOptions> {
        self.locks
            .acquire(key, &slot.lock, lock_id)
            .inspect_err(|e| self.record_lock_failure(e))
    }

    fn try_acquire_slot(
        &self,
        key: &str,
        slot: &EntrySlot,
        lock_id: &LockId,
    ) -> Result<LockOptions> {
        self.locks
            .try_acquire(key, &slot.lock, LockAccessType::Acquire, lock_id)
            .inspect_err(|e| self.record_lock_failure(e))
    }

    fn record_lock_failure(&self, error: &CacheError) {
        if matches!(
            error,
            CacheError::AlreadyLocked { .. } | CacheError::AcquireTimedOut { .. }
        ) {
            self.stats.lock().record_lock_failure();
        }
    }

    /// Releases `lock_id`'s lock on `key`.
    ///
    /// # Errors
    /// `NoSuchLock` if unlocked, `LockIdMismatch` if held by someone else.
    pub fn unlock(&self, key: &str, lock_id: &LockId) -> Result<()> {
        let slot = self.require_slot(key)?;
        self.locks.release(key, &slot.lock, lock_id)
    }

    /// Clears any lock on `key`, returning what was held.
    pub fn force_unlock(&self, key: &str) -> Result<Option<LockOptions>> {
        let slot = self.require_slot(key)?;
        Ok(self.locks.force_release(key, &slot.lock))
    }

    /// Whether `lock_id` currently holds the lock on `key`.
    ///
    /// # Errors
    /// `NotFound` for an unknown key, `NoSuchLock` if it is unlocked.
    pub fn compare_lock(&self, key: &str, lock_id: &LockId) -> Result<bool> {
        let slot = self.require_slot(key)?;
        self.locks.compare(key, &slot.lock, lock_id)
    }

    pub fn lock_info(&self, key: &str) -> Result<Option<LockOptions>> {
        Ok(self.require_slot(key)?.lock.current())
    }

    // == Attributes ==
    /// Replaces the indexed attributes of `key`. Counts as an access.
    pub fn set_attributes(
        &self,
        key: &str,
        attributes: Attributes,
        options: &WriteOptions,
    ) -> Result<()> {
        let slot = self.require_slot(key)?;
        if options.access == LockAccessType::Acquire {
            self.acquire_slot(key, &slot, require_lock_id(options.lock_id.as_ref())?)?;
        }

        let now = self.clock.now();
        let mut state = self.live_state(key, &slot, now)?;
        self.check_writable(key, &slot, options)?;
        self.index.update_entry(key, &state.attributes, &attributes)?;
        state.attributes = attributes;
        if let Some(hint) = state.hint.as_mut() {
            hint.touch(now);
        }
        self.finish_write(key, &slot, options);
        Ok(())
    }

    /// Declares a new indexed attribute and places every existing entry
    /// carrying it, returning how many were placed.
    ///
    /// Writers are held off while the buckets are rebuilt. One
    /// `IndexRebuilt` event is raised per placed entry.
    pub fn define_index(&self, name: &str, attr_type: AttrType) -> Result<usize> {
        self.index.define(name, attr_type)?;

        let placed = {
            let tables: Vec<_> = self.shards.iter().map(|shard| shard.read()).collect();
            let mut guards = Vec::new();
            let mut pairs = Vec::new();
            for table in &tables {
                for (key, slot) in table.iter() {
                    let state = slot.state.lock();
                    if let Some(value) = state.attributes.get(name) {
                        pairs.push((key.clone(), value.clone()));
                    }
                    guards.push(state);
                }
            }
            let placed = self.index.rebuild(name, pairs)?;
            drop(guards);
            placed
        };

        let now = self.clock.now();
        for key in &placed {
            self.listener.on_event(CacheEvent::new(
                key.as_str(),
                EventKind::IndexRebuilt {
                    attribute: name.to_string(),
                },
                now,
            ));
        }
        Ok(placed.len())
    }

    // == Query ==
    /// Checks a filter against the current index schema.
    pub fn compile(&self, expr: &Expr) -> Result<CompiledPredicate> {
        compile(expr, &self.index)
    }

    /// Keys of live entries matching `expr`, in natural key order.
    pub fn query(&self, expr: &Expr, params: &QueryParams) -> Result<Vec<String>> {
        let compiled = self.compile(expr)?;
        Ok(self.query_compiled(&compiled, params)?.into_iter().collect())
    }

    pub fn query_compiled(
        &self,
        predicate: &CompiledPredicate,
        params: &QueryParams,
    ) -> Result<BTreeSet<String>> {
        let mut keys = evaluate(predicate, &self.index, params)?;
        let now = self.clock.now();
        keys.retain(|key| {
            self.slot(key).is_some_and(|slot| {
                let state = slot.state.lock();
                !state.removed && !state.is_expired(now)
            })
        });
        Ok(keys)
    }

    /// One page of matching keys, sorted by an indexed attribute.
    pub fn query_page(
        &self,
        expr: &Expr,
        params: &QueryParams,
        order: &OrderBy,
        page: Page,
    ) -> Result<Vec<String>> {
        let compiled = self.compile(expr)?;
        let keys = self.query_compiled(&compiled, params)?;
        Ok(page.apply(order_keys(&keys, order, &self.index)?))
    }

    // == Maintenance ==
    /// Removes every lapsed entry, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        for (key, slot) in self.snapshot() {
            let lapsed = {
                let state = slot.state.lock();
                !state.removed && state.is_expired(now)
            };
            if lapsed && self.expire(&key, &slot, now) {
                removed += 1;
            }
        }
        removed
    }

    /// Force-releases locks held longer than the configured maximum age.
    pub fn release_stale_locks(&self) -> usize {
        let Some(max_age) = self.config.lock.max_lock_age() else {
            return 0;
        };
        self.snapshot()
            .iter()
            .filter(|(key, slot)| {
                self.locks
                    .release_if_older_than(key, &slot.lock, max_age)
                    .is_some()
            })
            .count()
    }

    /// Compacts the backing store and re-points every entry at its moved
    /// payload.
    pub fn compact(&self) -> CompactionReport {
        let report = self.arena.compact();
        if report.relocated == 0 {
            return report;
        }

        for (key, slot) in self.snapshot() {
            let mut state = slot.state.lock();
            if state.removed {
                continue;
            }
            match self.arena.refresh(&state.pointer) {
                Ok(pointer) => state.pointer = pointer,
                Err(e) => warn!(key, "Could not refresh payload pointer: {}", e),
            }
        }
        self.stats.lock().record_compaction();
        report
    }

    // == Payloads ==
    fn store_payload(&self, value: &[u8]) -> Result<ObjectPointer> {
        match self.arena.store(value) {
            Err(e) if e.is_recoverable() => {
                warn!("{}; sweeping and compacting before retry", e);
                let expired = self.cleanup_expired();
                let report = self.compact();
                debug!(expired, relocated = report.relocated, "Retrying allocation");
                self.arena.store(value)
            }
            other => other,
        }
    }

    /// Reads the entry's payload, following it if a compaction moved it
    /// before this entry was re-pointed.
    fn read_payload(&self, state: &mut EntryState) -> Result<Vec<u8>> {
        match self.arena.read(&state.pointer) {
            Err(CacheError::StalePointer(_)) => {
                let (current, bytes) = self.arena.read_refreshed(&state.pointer)?;
                state.pointer = current;
                Ok(bytes)
            }
            other => other,
        }
    }

    fn release_payload(&self, pointer: ObjectPointer) {
        let result = match self.arena.release(&pointer) {
            Err(CacheError::StalePointer(_)) => self.arena.release_refreshed(&pointer),
            other => other,
        };
        if let Err(e) = result {
            warn!("Failed to release payload {}: {}", pointer, e);
        }
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().clone();
        stats.total_entries = self.len();
        stats.arena_used = self.arena.stats().used;
        stats
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    /// Number of entries in the table, including lapsed ones not yet swept.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// == Helpers ==
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidRequest("Key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidRequest(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

fn require_lock_id(lock_id: Option<&LockId>) -> Result<&LockId> {
    lock_id.ok_or_else(|| CacheError::InvalidRequest("a lock id is required".to_string()))
}
