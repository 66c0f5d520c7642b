//! Per-map entry store with idle, age and count based eviction

use dso_common::{LockScope, ObjectIdSet, Value};
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Unread for longer than the idle limit
    Idle,
    /// Older than the age limit
    Expired,
    /// Over the count target
    Capacity,
}

/// Limits applied by [`LocalCache::sweep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionPolicy {
    /// Idle limit
    pub max_tti: Option<Duration>,
    /// Age limit
    pub max_ttl: Option<Duration>,
    /// Count target
    pub target_max_count: Option<usize>,
}

impl EvictionPolicy {
    fn expiry(&self, entry: &CacheEntry, now: Duration) -> Option<EvictionReason> {
        if entry.pinned {
            return None;
        }
        if let Some(ttl) = self.max_ttl {
            if now.saturating_sub(entry.created_at) >= ttl {
                return Some(EvictionReason::Expired);
            }
        }
        if let Some(tti) = self.max_tti {
            if now.saturating_sub(entry.last_access) >= tti {
                return Some(EvictionReason::Idle);
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub(crate) value: Value,
    pub(crate) scope: LockScope,
    pub(crate) created_at: Duration,
    pub(crate) last_access: Duration,
    pub(crate) pinned: bool,
}

/// Counts of entries removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Removed for idling
    pub idle: usize,
    /// Removed for age
    pub expired: usize,
    /// Removed to meet the count target
    pub capacity: usize,
}

impl SweepOutcome {
    /// Total removed.
    pub fn total(&self) -> usize {
        self.idle + self.expired + self.capacity
    }

    fn count(&mut self, reason: EvictionReason) {
        match reason {
            EvictionReason::Idle => self.idle += 1,
            EvictionReason::Expired => self.expired += 1,
            EvictionReason::Capacity => self.capacity += 1,
        }
    }
}

/// Entries of one map plus an epoch bumped on every local change, so a
/// fetch that overlapped a change can tell its result may be stale.
#[derive(Debug, Default)]
pub(crate) struct LocalCache {
    entries: FxHashMap<Value, CacheEntry>,
    epoch: u64,
}

impl LocalCache {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, key: &Value) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn keys(&self) -> Vec<Value> {
        self.entries.keys().cloned().collect()
    }

    /// Hit: refresh the access time. Entries found expired are removed.
    pub(crate) fn lookup(
        &mut self,
        key: &Value,
        policy: &EvictionPolicy,
        now: Duration,
    ) -> Result<Option<Value>, EvictionReason> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        if let Some(reason) = policy.expiry(entry, now) {
            self.entries.remove(key);
            return Err(reason);
        }
        entry.last_access = now;
        Ok(Some(entry.value.clone()))
    }

    /// Insert or overwrite, keeping the pin flag of an existing entry.
    pub(crate) fn store(&mut self, key: Value, value: Value, scope: LockScope, now: Duration) {
        self.epoch += 1;
        let pinned = self.entries.get(&key).is_some_and(|entry| entry.pinned);
        self.entries.insert(
            key,
            CacheEntry {
                value,
                scope,
                created_at: now,
                last_access: now,
                pinned,
            },
        );
    }

    pub(crate) fn invalidate(&mut self, key: &Value) -> bool {
        self.epoch += 1;
        self.entries.remove(key).is_some()
    }

    pub(crate) fn invalidate_all(&mut self) -> usize {
        self.epoch += 1;
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub(crate) fn set_pinned(&mut self, key: &Value, pinned: bool) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub(crate) fn invalidate_where(&mut self, mut doomed: impl FnMut(&Value, &CacheEntry) -> bool) -> usize {
        self.epoch += 1;
        let before = self.entries.len();
        self.entries.retain(|key, entry| !doomed(key, entry));
        before - self.entries.len()
    }

    pub(crate) fn invalidate_scope(&mut self, scope: &LockScope) -> usize {
        self.invalidate_where(|_, entry| &entry.scope == scope)
    }

    /// Entries whose key or value refers to any of `ids`.
    pub(crate) fn invalidate_referencing(&mut self, ids: &ObjectIdSet) -> usize {
        self.invalidate_where(|key, entry| {
            let mut refs = Vec::new();
            key.collect_references(&mut refs);
            entry.value.collect_references(&mut refs);
            refs.into_iter().any(|id| ids.contains(id))
        })
    }

    /// Drop expired entries, then the oldest-idle unpinned entries until the
    /// count target is met. Pinned entries are never swept.
    pub(crate) fn sweep(&mut self, policy: &EvictionPolicy, now: Duration) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        self.entries.retain(|_, entry| match policy.expiry(entry, now) {
            Some(reason) => {
                outcome.count(reason);
                false
            }
            None => true,
        });

        if let Some(target) = policy.target_max_count {
            if self.entries.len() > target {
                let mut idle: Vec<(Duration, Value)> = self
                    .entries
                    .iter()
                    .filter(|(_, entry)| !entry.pinned)
                    .map(|(key, entry)| (entry.last_access, key.clone()))
                    .collect();
                idle.sort_by_key(|(last_access, _)| *last_access);

                let excess = self.entries.len() - target;
                for (_, key) in idle.into_iter().take(excess) {
                    self.entries.remove(&key);
                    outcome.count(EvictionReason::Capacity);
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dso_common::ObjectId;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn key(k: &str) -> Value {
        Value::from(k)
    }

    fn fill(cache: &mut LocalCache, keys: &[&str], at: Duration) {
        for k in keys {
            cache.store(key(k), Value::Int(1), LockScope::unlocked(), at);
        }
    }

    #[test]
    fn test_idle_entries_expire_on_lookup() {
        let policy = EvictionPolicy {
            max_tti: Some(secs(10)),
            ..EvictionPolicy::default()
        };
        let mut cache = LocalCache::default();
        fill(&mut cache, &["a"], secs(0));

        assert_eq!(cache.lookup(&key("a"), &policy, secs(9)), Ok(Some(Value::Int(1))));
        // The read at 9s reset the idle clock
        assert_eq!(cache.lookup(&key("a"), &policy, secs(18)), Ok(Some(Value::Int(1))));
        assert_eq!(cache.lookup(&key("a"), &policy, secs(28)), Err(EvictionReason::Idle));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_ttl_ignores_reads() {
        let policy = EvictionPolicy {
            max_ttl: Some(secs(10)),
            ..EvictionPolicy::default()
        };
        let mut cache = LocalCache::default();
        fill(&mut cache, &["a"], secs(0));
        assert!(cache.lookup(&key("a"), &policy, secs(5)).is_ok());
        let outcome = cache.sweep(&policy, secs(10));
        assert_eq!(outcome.expired, 1);
    }

    #[test]
    fn test_count_target_evicts_oldest_idle_first() {
        let policy = EvictionPolicy {
            target_max_count: Some(2),
            ..EvictionPolicy::default()
        };
        let mut cache = LocalCache::default();
        fill(&mut cache, &["a"], secs(1));
        fill(&mut cache, &["b"], secs(2));
        fill(&mut cache, &["c"], secs(3));
        fill(&mut cache, &["d"], secs(4));
        cache.lookup(&key("a"), &policy, secs(5)).unwrap();

        let outcome = cache.sweep(&policy, secs(6));
        assert_eq!(outcome.capacity, 2);
        let mut left = cache.keys();
        left.sort_by_key(|k| k.as_str().map(str::to_string));
        assert_eq!(left, vec![key("a"), key("d")]);
    }

    #[test]
    fn test_pinned_entries_survive_sweeps_but_not_invalidation() {
        let policy = EvictionPolicy {
            max_tti: Some(secs(1)),
            target_max_count: Some(1),
            ..EvictionPolicy::default()
        };
        let mut cache = LocalCache::default();
        fill(&mut cache, &["a", "b"], secs(0));
        assert!(cache.set_pinned(&key("a"), true));
        assert!(!cache.set_pinned(&key("zz"), true));

        let outcome = cache.sweep(&policy, secs(100));
        assert_eq!(outcome.total(), 1);
        assert!(cache.contains(&key("a")));

        assert!(cache.invalidate(&key("a")));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_targeted_invalidation() {
        let mut cache = LocalCache::default();
        cache.store(key("a"), Value::Ref(ObjectId::new(7)), LockScope::new("l1"), secs(0));
        cache.store(key("b"), Value::Int(2), LockScope::new("l2"), secs(0));
        cache.store(key("c"), Value::List(vec![Value::Ref(ObjectId::new(8))]), LockScope::new("l2"), secs(0));

        let collected: ObjectIdSet = [ObjectId::new(8)].into_iter().collect();
        assert_eq!(cache.invalidate_referencing(&collected), 1);
        assert_eq!(cache.invalidate_scope(&LockScope::new("l1")), 1);
        assert_eq!(cache.keys(), vec![key("b")]);

        let epoch = cache.epoch();
        cache.invalidate_all();
        assert!(cache.epoch() > epoch);
    }
}
