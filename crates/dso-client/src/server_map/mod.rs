//! Server-backed maps with a bounded local cache
//!
//! The server owns the contents. Every mutation goes to the server first
//! and reaches the local cache only once acknowledged, so the cache is
//! never ahead of the authority. Reads hit the cache or fetch on a miss.

mod local_cache;

pub use local_cache::{EvictionPolicy, EvictionReason, SweepOutcome};

use crate::clock::Clock;
use crate::config::ServerMapConfig;
use crate::periodic::PeriodicTask;
use crate::remote::ServerMapSource;
use crate::shared::SharedObject;
use dso_common::{
    Dna, DnaWriter, DsoError, DsoResult, LockScope, LogicalOp, NULL_OBJECT_ID, ObjectId, ObjectIdSet,
    Value,
};
use local_cache::LocalCache;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Class descriptor of server map objects.
pub const SERVER_MAP_CLASS: &str = "ServerMap";

/// The shared object standing for a server map. Its contents never live
/// in the object graph of a client; they are read through [`ServerMap`].
#[derive(Debug, Default)]
pub struct MapHandle;

impl SharedObject for MapHandle {
    fn class_name(&self) -> &str {
        SERVER_MAP_CLASS
    }

    fn dehydrate(&self, _writer: &mut DnaWriter) {}

    fn hydrate(&mut self, _dna: &Dna) -> DsoResult<()> {
        Ok(())
    }

    fn apply_logical(&mut self, op: &LogicalOp) -> DsoResult<()> {
        if op.is_map_op() {
            Ok(())
        } else {
            Err(DsoError::invalid_dna(
                NULL_OBJECT_ID,
                format!("{SERVER_MAP_CLASS} does not support {op:?}"),
            ))
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evicted_idle: AtomicU64,
    evicted_expired: AtomicU64,
    evicted_capacity: AtomicU64,
    invalidated: AtomicU64,
}

impl CacheCounters {
    fn evicted(&self, reason: EvictionReason, count: u64) {
        let counter = match reason {
            EvictionReason::Idle => &self.evicted_idle,
            EvictionReason::Expired => &self.evicted_expired,
            EvictionReason::Capacity => &self.evicted_capacity,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }
}

/// Cache statistics of one map.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Map object
    pub map_id: ObjectId,
    /// Entries currently cached
    pub local_size: usize,
    /// Reads served locally
    pub hits: u64,
    /// Reads that went to the server
    pub misses: u64,
    /// Entries evicted for idling
    pub evicted_idle: u64,
    /// Entries evicted for age
    pub evicted_expired: u64,
    /// Entries evicted over the count target
    pub evicted_capacity: u64,
    /// Entries dropped by invalidation
    pub invalidated: u64,
}

/// Client view of one server-owned map.
pub struct ServerMap {
    map_id: ObjectId,
    source: Arc<dyn ServerMapSource>,
    clock: Arc<dyn Clock>,
    policy: EvictionPolicy,
    enabled: AtomicBool,
    cache: Mutex<LocalCache>,
    counters: CacheCounters,
}

impl std::fmt::Debug for ServerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMap")
            .field("map_id", &self.map_id)
            .field("policy", &self.policy)
            .field("local_size", &self.local_size())
            .finish()
    }
}

impl ServerMap {
    /// Cache over map `map_id`.
    pub fn new(
        map_id: ObjectId,
        source: Arc<dyn ServerMapSource>,
        config: &ServerMapConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            map_id,
            source,
            clock,
            policy: EvictionPolicy {
                max_tti: config.max_tti(),
                max_ttl: config.max_ttl(),
                target_max_count: config.target_max_count(),
            },
            enabled: AtomicBool::new(config.local_cache_enabled),
            cache: Mutex::new(LocalCache::default()),
            counters: CacheCounters::default(),
        }
    }

    /// Map object id.
    pub fn map_id(&self) -> ObjectId {
        self.map_id
    }

    fn is_caching(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Value for `key`: from the local cache, else from the server.
    pub fn get(&self, key: &Value) -> DsoResult<Option<Value>> {
        let epoch = {
            let mut cache = self.cache.lock();
            if self.is_caching() {
                match cache.lookup(key, &self.policy, self.clock.now()) {
                    Ok(Some(value)) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(value));
                    }
                    Ok(None) => {}
                    Err(reason) => self.counters.evicted(reason, 1),
                }
            }
            cache.epoch()
        };
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let fetched = self.source.get(self.map_id, key)?;
        if let Some(value) = &fetched {
            let mut cache = self.cache.lock();
            // Anything that changed the cache meanwhile may have made this stale
            if self.is_caching() && cache.epoch() == epoch {
                cache.store(key.clone(), value.clone(), LockScope::unlocked(), self.clock.now());
            } else {
                tracing::trace!(target: "dso::cache", map = %self.map_id, ?key, "discarding overlapped fetch");
            }
        }
        Ok(fetched)
    }

    /// Associate `key` with `value`. Returns the previous value.
    pub fn put(&self, key: Value, value: Value, scope: &LockScope) -> DsoResult<Option<Value>> {
        let previous = self.source.put(self.map_id, key.clone(), value.clone(), scope)?;
        self.install(key, value, scope);
        Ok(previous)
    }

    /// Remove `key`. Returns the previous value.
    pub fn remove(&self, key: &Value, scope: &LockScope) -> DsoResult<Option<Value>> {
        let previous = self.source.remove(self.map_id, key, scope)?;
        self.cache.lock().invalidate(key);
        Ok(previous)
    }

    /// Insert unless present. Returns the value that was already there.
    pub fn put_if_absent(&self, key: Value, value: Value, scope: &LockScope) -> DsoResult<Option<Value>> {
        let existing = self
            .source
            .put_if_absent(self.map_id, key.clone(), value.clone(), scope)?;
        match &existing {
            Some(current) => self.install(key, current.clone(), scope),
            None => self.install(key, value, scope),
        }
        Ok(existing)
    }

    /// Replace only if present. Returns the previous value.
    pub fn replace(&self, key: Value, value: Value, scope: &LockScope) -> DsoResult<Option<Value>> {
        let previous = self.source.replace(self.map_id, key.clone(), value.clone(), scope)?;
        if previous.is_some() {
            self.install(key, value, scope);
        } else {
            self.cache.lock().invalidate(&key);
        }
        Ok(previous)
    }

    /// Remove every entry, here and on the server.
    pub fn clear(&self, scope: &LockScope) -> DsoResult<()> {
        self.source.clear(self.map_id, scope)?;
        self.cache.lock().invalidate_all();
        Ok(())
    }

    /// Authoritative entry count.
    pub fn size(&self) -> DsoResult<usize> {
        self.source.size(self.map_id)
    }

    fn install(&self, key: Value, value: Value, scope: &LockScope) {
        let mut cache = self.cache.lock();
        if self.is_caching() {
            cache.store(key, value, scope.clone(), self.clock.now());
        } else {
            cache.invalidate(&key);
        }
    }

    /// Entries cached locally.
    pub fn local_size(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether `key` is cached locally.
    pub fn contains_local_key(&self, key: &Value) -> bool {
        self.cache.lock().contains(key)
    }

    /// Locally cached keys, in no particular order.
    pub fn local_keys(&self) -> Vec<Value> {
        self.cache.lock().keys()
    }

    /// Turn local caching on or off. Turning it off drops every entry.
    pub fn set_local_cache_enabled(&self, enabled: bool) {
        let mut cache = self.cache.lock();
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            cache.invalidate_all();
        }
    }

    /// Exempt a cached entry from eviction sweeps. Returns whether it was cached.
    pub fn pin(&self, key: &Value) -> bool {
        self.cache.lock().set_pinned(key, true)
    }

    /// Make a pinned entry evictable again.
    pub fn unpin(&self, key: &Value) -> bool {
        self.cache.lock().set_pinned(key, false)
    }

    /// Drop `key` because it changed elsewhere.
    pub fn invalidate(&self, key: &Value) -> bool {
        let removed = self.cache.lock().invalidate(key);
        if removed {
            self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every entry because the map was cleared elsewhere.
    pub fn invalidate_all(&self) -> usize {
        let removed = self.cache.lock().invalidate_all();
        self.counters.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// The server evicted `key`; forget it locally too.
    pub fn evicted_in_server(&self, key: &Value) {
        if self.invalidate(key) {
            tracing::trace!(target: "dso::cache", map = %self.map_id, ?key, "evicted in server");
        }
    }

    /// Drop entries cached under `scope`, e.g. when the lock is recalled.
    pub fn remove_entries_for_lock(&self, scope: &LockScope) -> usize {
        let removed = self.cache.lock().invalidate_scope(scope);
        self.counters.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop entries whose key or value refers to a collected object.
    pub fn remove_entries_for_object_ids(&self, ids: &ObjectIdSet) -> usize {
        let removed = self.cache.lock().invalidate_referencing(ids);
        self.counters.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Run one eviction sweep.
    pub fn evict(&self) -> SweepOutcome {
        let outcome = self.cache.lock().sweep(&self.policy, self.clock.now());
        self.counters.evicted(EvictionReason::Idle, outcome.idle as u64);
        self.counters.evicted(EvictionReason::Expired, outcome.expired as u64);
        self.counters.evicted(EvictionReason::Capacity, outcome.capacity as u64);
        if outcome.total() > 0 {
            tracing::debug!(
                target: "dso::cache",
                map = %self.map_id,
                idle = outcome.idle,
                expired = outcome.expired,
                capacity = outcome.capacity,
                "evicted local entries"
            );
        }
        outcome
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            map_id: self.map_id,
            local_size: self.local_size(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evicted_idle: self.counters.evicted_idle.load(Ordering::Relaxed),
            evicted_expired: self.counters.evicted_expired.load(Ordering::Relaxed),
            evicted_capacity: self.counters.evicted_capacity.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
        }
    }
}

/// Every server map this process has opened, plus the eviction thread.
pub struct ServerMapRegistry {
    source: Arc<dyn ServerMapSource>,
    config: ServerMapConfig,
    clock: Arc<dyn Clock>,
    maps: RwLock<FxHashMap<ObjectId, Arc<ServerMap>>>,
    evictor: Mutex<Option<PeriodicTask>>,
}

impl std::fmt::Debug for ServerMapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMapRegistry")
            .field("maps", &self.maps.read().len())
            .field("config", &self.config)
            .finish()
    }
}

impl ServerMapRegistry {
    /// Registry whose maps read from `source`.
    pub fn new(source: Arc<dyn ServerMapSource>, config: ServerMapConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            source,
            config,
            clock,
            maps: RwLock::new(FxHashMap::default()),
            evictor: Mutex::new(None),
        })
    }

    /// Settings.
    pub fn config(&self) -> &ServerMapConfig {
        &self.config
    }

    /// The cache for `map_id`, opening it on first use.
    pub fn map(&self, map_id: ObjectId) -> Arc<ServerMap> {
        if let Some(map) = self.maps.read().get(&map_id) {
            return Arc::clone(map);
        }
        let mut maps = self.maps.write();
        Arc::clone(maps.entry(map_id).or_insert_with(|| {
            Arc::new(ServerMap::new(
                map_id,
                Arc::clone(&self.source),
                &self.config,
                Arc::clone(&self.clock),
            ))
        }))
    }

    /// The cache for `map_id` if it is open.
    pub fn get(&self, map_id: ObjectId) -> Option<Arc<ServerMap>> {
        self.maps.read().get(&map_id).cloned()
    }

    fn open_maps(&self) -> Vec<Arc<ServerMap>> {
        self.maps.read().values().cloned().collect()
    }

    /// Sweep every map. Returns the number of entries evicted.
    pub fn evict_all(&self) -> usize {
        self.open_maps().iter().map(|map| map.evict().total()).sum()
    }

    /// Drop `keys` of `map_id` after a change elsewhere.
    pub fn invalidate(&self, map_id: ObjectId, keys: &[Value]) -> usize {
        match self.get(map_id) {
            Some(map) => keys.iter().filter(|key| map.invalidate(key)).count(),
            None => 0,
        }
    }

    /// Drop everything cached for `map_id`.
    pub fn invalidate_all(&self, map_id: ObjectId) -> usize {
        self.get(map_id).map_or(0, |map| map.invalidate_all())
    }

    /// Collected objects: drop entries referring to them, and caches of
    /// maps that were collected themselves.
    pub fn remove_entries_for_object_ids(&self, ids: &ObjectIdSet) -> usize {
        let dropped: Vec<Arc<ServerMap>> = {
            let mut maps = self.maps.write();
            ids.iter().filter_map(|id| maps.remove(&id)).collect()
        };
        let mut removed: usize = dropped.iter().map(|map| map.local_size()).sum();
        removed += self
            .open_maps()
            .iter()
            .map(|map| map.remove_entries_for_object_ids(ids))
            .sum::<usize>();
        removed
    }

    /// Drop entries cached under `scope` in every map.
    pub fn remove_entries_for_lock(&self, scope: &LockScope) -> usize {
        self.open_maps()
            .iter()
            .map(|map| map.remove_entries_for_lock(scope))
            .sum()
    }

    /// Turn local caching on or off for every open map.
    pub fn set_local_cache_enabled(&self, enabled: bool) {
        for map in self.open_maps() {
            map.set_local_cache_enabled(enabled);
        }
    }

    /// Statistics of every open map, ordered by id.
    pub fn stats(&self) -> Vec<CacheStats> {
        let mut stats: Vec<CacheStats> = self.open_maps().iter().map(|map| map.stats()).collect();
        stats.sort_by_key(|s| s.map_id);
        stats
    }

    /// Start the periodic eviction thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let mut evictor = self.evictor.lock();
        if evictor.is_some() {
            return Ok(());
        }
        let registry: Weak<Self> = Arc::downgrade(self);
        *evictor = Some(PeriodicTask::spawn(
            "dso-map-evictor",
            self.config.eviction_interval(),
            move || match registry.upgrade() {
                Some(registry) => {
                    registry.evict_all();
                    true
                }
                None => false,
            },
        )?);
        Ok(())
    }

    /// Stop the eviction thread.
    pub fn stop(&self) {
        let evictor = self.evictor.lock().take();
        if let Some(evictor) = evictor {
            evictor.stop();
        }
    }
}

impl Drop for ServerMapRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}
