//! Records sent along with a fault-in but not faulted in yet
//!
//! The server counts every record it sends as held by this process, so
//! records that sit here unused keep their objects alive. Records are kept in
//! per-round-trip batches; a batch nobody takes from for two sweeps, or the
//! oldest batch once there are more than the cap, is dropped and its ids are
//! handed back to the caller for release.

use dso_common::{Dna, ObjectId};
use indexmap::IndexMap;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

struct Batch {
    ids: FxHashSet<ObjectId>,
    accessed: bool,
}

pub(crate) struct PrefetchCache {
    records: FxHashMap<ObjectId, (Dna, u64)>,
    batches: IndexMap<u64, Batch, FxBuildHasher>,
    next_batch: u64,
    max_batches: usize,
}

impl PrefetchCache {
    pub(crate) fn new(max_batches: usize) -> Self {
        Self {
            records: FxHashMap::default(),
            batches: IndexMap::with_hasher(FxBuildHasher),
            next_batch: 0,
            max_batches,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.records.contains_key(&id)
    }

    /// Keep one round trip's extra records. Returns the ids of the batches
    /// evicted to stay within the cap.
    pub(crate) fn add_batch(&mut self, records: impl IntoIterator<Item = Dna>) -> Vec<ObjectId> {
        let batch_id = self.next_batch;
        let mut ids = FxHashSet::default();
        for dna in records {
            let id = dna.id;
            // A newer copy moves the id into this batch
            if let Some((_, previous)) = self.records.insert(id, (dna, batch_id)) {
                self.forget_in_batch(previous, id);
            }
            ids.insert(id);
        }
        if ids.is_empty() {
            return Vec::new();
        }
        self.next_batch += 1;
        self.batches.insert(batch_id, Batch { ids, accessed: true });

        let mut evicted = Vec::new();
        while self.batches.len() > self.max_batches.max(1) {
            let Some((_, batch)) = self.batches.shift_remove_index(0) else {
                break;
            };
            self.drop_records(batch, &mut evicted);
        }
        evicted
    }

    /// Hand out the record for `id`, marking its batch as in use.
    pub(crate) fn take(&mut self, id: ObjectId) -> Option<Dna> {
        let (dna, batch_id) = self.records.remove(&id)?;
        if let Some(batch) = self.batches.get_mut(&batch_id) {
            batch.accessed = true;
        }
        self.forget_in_batch(batch_id, id);
        Some(dna)
    }

    /// Forget `id` without counting it as a use.
    pub(crate) fn remove(&mut self, id: ObjectId) -> bool {
        match self.records.remove(&id) {
            Some((_, batch_id)) => {
                self.forget_in_batch(batch_id, id);
                true
            }
            None => false,
        }
    }

    /// Drop batches untouched since the previous sweep and reset the mark on
    /// the others. Returns the dropped ids.
    pub(crate) fn expire(&mut self) -> Vec<ObjectId> {
        let mut stale = Vec::new();
        self.batches.retain(|_, batch| {
            if batch.accessed {
                batch.accessed = false;
                true
            } else {
                stale.push(std::mem::take(&mut batch.ids));
                false
            }
        });
        let mut expired = Vec::new();
        for ids in stale {
            for id in ids {
                if self.records.remove(&id).is_some() {
                    expired.push(id);
                }
            }
        }
        expired
    }

    /// Drop everything. Returns the dropped ids.
    pub(crate) fn drain(&mut self) -> Vec<ObjectId> {
        self.batches.clear();
        self.records.drain().map(|(id, _)| id).collect()
    }

    fn drop_records(&mut self, batch: Batch, out: &mut Vec<ObjectId>) {
        for id in batch.ids {
            if self.records.remove(&id).is_some() {
                out.push(id);
            }
        }
    }

    fn forget_in_batch(&mut self, batch_id: u64, id: ObjectId) {
        let Some(batch) = self.batches.get_mut(&batch_id) else {
            return;
        };
        batch.ids.remove(&id);
        if batch.ids.is_empty() {
            self.batches.shift_remove(&batch_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(raw: u64) -> Dna {
        Dna::new_object(ObjectId::new(raw), "Node")
    }

    fn sorted(mut ids: Vec<ObjectId>) -> Vec<u64> {
        ids.sort();
        ids.into_iter().map(ObjectId::to_u64).collect()
    }

    #[test]
    fn test_untouched_batch_expires_on_second_sweep() {
        let mut cache = PrefetchCache::new(8);
        cache.add_batch([record(1), record(2)]);
        assert!(cache.expire().is_empty());
        assert_eq!(sorted(cache.expire()), vec![1, 2]);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_taking_keeps_the_rest_of_the_batch() {
        let mut cache = PrefetchCache::new(8);
        cache.add_batch([record(1), record(2), record(3)]);
        assert!(cache.expire().is_empty());
        assert!(cache.take(ObjectId::new(1)).is_some());
        assert!(cache.expire().is_empty());
        assert_eq!(sorted(cache.expire()), vec![2, 3]);
    }

    #[test]
    fn test_cap_evicts_oldest_batch() {
        let mut cache = PrefetchCache::new(2);
        assert!(cache.add_batch([record(1)]).is_empty());
        assert!(cache.add_batch([record(2), record(3)]).is_empty());
        assert_eq!(sorted(cache.add_batch([record(4)])), vec![1]);
        assert_eq!(cache.len(), 3);
        assert!(cache.take(ObjectId::new(1)).is_none());
    }

    #[test]
    fn test_refetched_record_moves_to_newest_batch() {
        let mut cache = PrefetchCache::new(2);
        cache.add_batch([record(1), record(2)]);
        cache.add_batch([record(2)]);
        assert_eq!(sorted(cache.add_batch([record(3)])), vec![1]);
        assert!(cache.take(ObjectId::new(2)).is_some());
    }

    #[test]
    fn test_remove_and_drain() {
        let mut cache = PrefetchCache::new(8);
        cache.add_batch([record(1), record(2)]);
        assert!(cache.remove(ObjectId::new(1)));
        assert!(!cache.remove(ObjectId::new(1)));
        assert_eq!(sorted(cache.drain()), vec![2]);
        assert!(cache.expire().is_empty());
    }
}
