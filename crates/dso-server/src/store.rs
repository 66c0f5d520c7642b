//! Managed object store
//!
//! The authoritative table of every live object. Concurrency is per record:
//! readers and transactions pin a record with [`ObjectStore::checkout`],
//! while delta application takes that one record's lock. Two store-wide
//! locks exist only to coordinate with the DGC:
//!
//! - the *apply gate* is held shared by every mutation (delta, create,
//!   root binding, fault-in bookkeeping) and exclusively by a DGC pass from
//!   its pause until its sweep is done, so the rescue phase sees a quiet graph
//! - the *collection lock* is held exclusively only while the sweep removes
//!   records; replication cursors hold it shared so they never observe a
//!   half-finished sweep

use crate::back_refs::BackReferenceIndex;
use crate::config::ObjectManagerConfig;
use crate::dgc::change_collector::{NewReferenceCollector, YoungGenChangeCollector};
use crate::record::{ManagedObjectRecord, ManagedObjectState};
use crate::roots::{RootSnapshot, RootTable};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dso_common::{Dna, DsoError, DsoResult, ObjectId, ObjectIdBatch, ObjectIdSet, Value};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::{FxBuildHasher, FxHashSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Whether `apply_delta` enforces the version check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Reject deltas built against an older version
    Normal,
    /// Apply regardless of version (administrative repair)
    Forced,
}

#[derive(Debug)]
struct RecordCell {
    checkouts: AtomicU32,
    record: Mutex<ManagedObjectRecord>,
}

/// A checked-out record. Dropping it releases the checkout.
#[derive(Debug)]
pub struct CheckedOut {
    id: ObjectId,
    cell: Arc<RecordCell>,
    outstanding: Arc<AtomicUsize>,
}

impl CheckedOut {
    /// Id of the pinned record.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.cell.record.lock().version
    }

    /// Read the record under its lock.
    pub fn with_record<R>(&self, f: impl FnOnce(&ManagedObjectRecord) -> R) -> R {
        f(&self.cell.record.lock())
    }

    /// Full-state DNA of the record.
    pub fn dehydrate(&self) -> Dna {
        self.cell.record.lock().dehydrate()
    }
}

impl Drop for CheckedOut {
    fn drop(&mut self) {
        let mut record = self.cell.record.lock();
        if self.cell.checkouts.fetch_sub(1, Ordering::AcqRel) == 1 {
            record.is_new = false;
            record.is_dirty = false;
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Outcome of a sweep attempt on one id.
#[derive(Debug)]
pub enum RemoveOutcome {
    /// Record deleted; carries the children it referenced
    Removed(FxHashSet<ObjectId>),
    /// Record is checked out and stays
    CheckedOut,
    /// Record already gone
    Missing,
}

#[derive(Debug)]
struct Tombstones {
    ids: ObjectIdSet,
    order: VecDeque<ObjectId>,
    limit: usize,
}

impl Tombstones {
    fn new(limit: usize) -> Self {
        Self {
            ids: ObjectIdSet::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    fn add(&mut self, id: ObjectId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.limit > 0 && self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(oldest);
            }
        }
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Live records
    pub objects: usize,
    /// Records created and not yet released by their creator
    pub new_objects: usize,
    /// Records changed since their last release
    pub dirty_objects: usize,
    /// Records with a non-zero checkout count
    pub checked_out_objects: usize,
    /// Sum of all checkout counts (leaked checkouts show up here)
    pub outstanding_checkouts: usize,
    /// Bound roots
    pub roots: usize,
    /// Back-reference edges
    pub back_reference_edges: usize,
    /// Remembered collected ids
    pub tombstones: usize,
    /// Next id to be allocated
    pub next_object_id: u64,
}

/// The managed object table plus its indices.
#[derive(Debug)]
pub struct ObjectStore {
    records: DashMap<ObjectId, Arc<RecordCell>, FxBuildHasher>,
    back_refs: BackReferenceIndex,
    roots: RootTable,
    tombstones: Mutex<Tombstones>,
    apply_gate: RwLock<()>,
    collection_lock: RwLock<()>,
    new_references: NewReferenceCollector,
    young_gen: YoungGenChangeCollector,
    outstanding: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl ObjectStore {
    /// Create an empty store.
    pub fn new(config: &ObjectManagerConfig) -> Self {
        Self {
            records: DashMap::default(),
            back_refs: BackReferenceIndex::new(),
            roots: RootTable::new(),
            tombstones: Mutex::new(Tombstones::new(config.tombstone_limit)),
            apply_gate: RwLock::new(()),
            collection_lock: RwLock::new(()),
            new_references: NewReferenceCollector::new(),
            young_gen: YoungGenChangeCollector::new(config.young_gen_enabled),
            outstanding: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Reserve `count` consecutive ids.
    pub fn allocate_ids(&self, count: u64) -> ObjectIdBatch {
        let count = count.max(1);
        let start = self.next_id.fetch_add(count, Ordering::AcqRel);
        ObjectIdBatch::new(start, start + count)
    }

    /// Reserve a single id.
    pub fn next_object_id(&self) -> ObjectId {
        ObjectId::new(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    fn missing(&self, id: ObjectId) -> DsoError {
        if self.tombstones.lock().ids.contains(id) {
            DsoError::Tombstoned(id)
        } else {
            DsoError::NotFound(id)
        }
    }

    fn cell(&self, id: ObjectId) -> DsoResult<Arc<RecordCell>> {
        self.records
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| self.missing(id))
    }

    fn pin(&self, id: ObjectId, cell: Arc<RecordCell>) -> CheckedOut {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        CheckedOut {
            id,
            cell,
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    /// Insert a new object from its initial DNA. The record comes back
    /// checked out so it cannot be collected before the creator links it.
    pub fn create_object(&self, dna: &Dna) -> DsoResult<CheckedOut> {
        let id = dna.id;
        if id.is_null() {
            return Err(DsoError::invalid_dna(id, "cannot create the null object"));
        }
        if dna.is_delta() {
            return Err(DsoError::invalid_dna(id, "creation requires new-object DNA"));
        }
        if self.tombstones.lock().ids.contains(id) {
            return Err(DsoError::Tombstoned(id));
        }

        let mut record = ManagedObjectRecord::new(id, dna.class_name.clone());
        let changes = record.apply(dna)?;
        record.version = dna.version + 1;
        let cell = Arc::new(RecordCell {
            checkouts: AtomicU32::new(1),
            record: Mutex::new(record),
        });

        let _gate = self.apply_gate.read();
        match self.records.entry(id) {
            Entry::Occupied(_) => {
                return Err(DsoError::invalid_dna(id, "object already exists"));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&cell));
            }
        }
        for child in &changes.added {
            self.back_refs.add_edge(id, *child);
        }
        self.new_references.record(changes.added.iter().copied());
        self.young_gen.object_created(id);
        self.next_id.fetch_max(id.to_u64() + 1, Ordering::AcqRel);

        tracing::trace!(target: "dso::store", id = id.to_u64(), class = %dna.class_name, "object created");
        Ok(self.pin(id, cell))
    }

    /// Install a record copied from another store, keeping its version.
    /// The record is not checked out and not new.
    pub fn install_replica(&self, dna: &Dna) -> DsoResult<()> {
        let id = dna.id;
        let mut record = ManagedObjectRecord::new(id, dna.class_name.clone());
        let changes = record.apply(dna)?;
        record.version = dna.version;
        record.is_new = false;
        record.is_dirty = false;
        let cell = Arc::new(RecordCell {
            checkouts: AtomicU32::new(0),
            record: Mutex::new(record),
        });

        let _gate = self.apply_gate.read();
        match self.records.entry(id) {
            Entry::Occupied(_) => {
                return Err(DsoError::invalid_dna(id, "replica already installed"));
            }
            Entry::Vacant(slot) => {
                slot.insert(cell);
            }
        }
        for child in &changes.added {
            self.back_refs.add_edge(id, *child);
        }
        self.next_id.fetch_max(id.to_u64() + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Pin a record against collection.
    pub fn checkout(&self, id: ObjectId) -> DsoResult<CheckedOut> {
        let cell = {
            let entry = self.records.get(&id).ok_or_else(|| self.missing(id))?;
            // Incremented under the shard guard so a sweep cannot slip in
            entry.checkouts.fetch_add(1, Ordering::AcqRel);
            Arc::clone(entry.value())
        };
        Ok(self.pin(id, cell))
    }

    /// Release a checkout.
    pub fn release(&self, handle: CheckedOut) {
        drop(handle);
    }

    /// Apply a delta to a checked-out record and return its new version.
    pub fn apply_delta(
        &self,
        handle: &CheckedOut,
        dna: &Dna,
        transaction_version: u64,
        mode: ApplyMode,
    ) -> DsoResult<u64> {
        let _gate = self.apply_gate.read();
        let mut record = handle.cell.record.lock();
        if mode == ApplyMode::Normal && transaction_version < record.version {
            return Err(DsoError::StaleVersion {
                id: handle.id,
                current: record.version,
                attempted: transaction_version,
            });
        }

        let changes = record.apply(dna)?;
        for child in &changes.added {
            self.back_refs.add_edge(handle.id, *child);
        }
        for child in &changes.removed {
            self.back_refs.remove_edge(handle.id, *child);
        }
        self.new_references.record(changes.added.iter().copied());

        record.version = record.version.max(transaction_version) + 1;
        tracing::trace!(
            target: "dso::store",
            id = handle.id.to_u64(),
            version = record.version,
            added = changes.added.len(),
            removed = changes.removed.len(),
            "delta applied"
        );
        Ok(record.version)
    }

    /// Bind a root unless already bound; returns the id it resolves to.
    pub fn create_root(&self, name: &str, id: ObjectId) -> DsoResult<ObjectId> {
        let _gate = self.apply_gate.read();
        if !self.records.contains_key(&id) {
            return Err(self.missing(id));
        }
        let bound = self.roots.create_root(name, id);
        self.new_references.record([bound]);
        Ok(bound)
    }

    /// Bind or rebind a root; returns the previous id.
    pub fn create_or_replace_root(&self, name: &str, id: ObjectId) -> DsoResult<Option<ObjectId>> {
        let _gate = self.apply_gate.read();
        if !self.records.contains_key(&id) {
            return Err(self.missing(id));
        }
        let previous = self.roots.create_or_replace_root(name, id);
        self.new_references.record([id]);
        Ok(previous)
    }

    /// Resolve a root.
    pub fn lookup_root(&self, name: &str) -> Option<ObjectId> {
        self.roots.lookup_root(name)
    }

    /// Root table.
    pub fn roots(&self) -> &RootTable {
        &self.roots
    }

    /// Back-reference index.
    pub fn back_refs(&self) -> &BackReferenceIndex {
        &self.back_refs
    }

    /// Collector of references added during a DGC pass.
    pub fn new_references(&self) -> &NewReferenceCollector {
        &self.new_references
    }

    /// Young-generation tracker.
    pub fn young_gen(&self) -> &YoungGenChangeCollector {
        &self.young_gen
    }

    /// Forward references of a record, without checking it out.
    pub fn references_of(&self, id: ObjectId) -> Option<FxHashSet<ObjectId>> {
        let cell = self.cell(id).ok()?;
        let references = cell.record.lock().references.clone();
        Some(references)
    }

    /// Full-state DNA of a record, without checking it out.
    pub fn snapshot_of(&self, id: ObjectId) -> DsoResult<Dna> {
        Ok(self.cell(id)?.record.lock().dehydrate())
    }

    /// Read a record under its lock, without checking it out.
    pub fn with_record<R>(
        &self,
        id: ObjectId,
        f: impl FnOnce(&ManagedObjectRecord) -> R,
    ) -> DsoResult<R> {
        let cell = self.cell(id)?;
        let record = cell.record.lock();
        Ok(f(&record))
    }

    /// Entry of a logical map.
    pub fn map_get(&self, map_id: ObjectId, key: &Value) -> DsoResult<Option<Value>> {
        self.with_record(map_id, |record| record.state().map_get(key).cloned())
    }

    /// Entry count of a logical map.
    pub fn map_size(&self, map_id: ObjectId) -> DsoResult<usize> {
        self.with_record(map_id, |record| match record.state() {
            ManagedObjectState::Map(map) => map.len(),
            _ => 0,
        })
    }

    /// Keys of a logical map, in insertion order.
    pub fn map_keys(&self, map_id: ObjectId) -> DsoResult<Vec<Value>> {
        self.with_record(map_id, |record| match record.state() {
            ManagedObjectState::Map(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        })
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.records.contains_key(&id)
    }

    /// Whether `id` was collected (and is still remembered).
    pub fn is_tombstoned(&self, id: ObjectId) -> bool {
        self.tombstones.lock().ids.contains(id)
    }

    /// Live record count.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Checkout count of a record.
    pub fn checkout_count(&self, id: ObjectId) -> Option<u32> {
        self.records
            .get(&id)
            .map(|entry| entry.checkouts.load(Ordering::Acquire))
    }

    /// Sum of all checkout counts.
    pub fn outstanding_checkouts(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Ids with a non-zero checkout count.
    pub fn checked_out_ids(&self) -> ObjectIdSet {
        self.records
            .iter()
            .filter(|entry| entry.checkouts.load(Ordering::Acquire) > 0)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Every live id.
    pub fn all_object_ids(&self) -> ObjectIdSet {
        self.records.iter().map(|entry| *entry.key()).collect()
    }

    /// Block mutations until the guard drops. Used by the DGC pause.
    pub fn pause_mutations(&self) -> RwLockWriteGuard<'_, ()> {
        self.apply_gate.write()
    }

    /// Hold mutations off for a read-side consistency window (fault-in
    /// bookkeeping that must not straddle a DGC pause).
    pub fn mutation_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.apply_gate.read()
    }

    /// Exclude cursors while records are being removed.
    pub fn begin_sweep(&self) -> RwLockWriteGuard<'_, ()> {
        self.collection_lock.write()
    }

    /// Delete a record if nobody has it checked out, unlinking it from the
    /// back-reference index and tombstoning its id.
    pub fn remove_if_collectable(&self, id: ObjectId) -> RemoveOutcome {
        let removed = self
            .records
            .remove_if(&id, |_, cell| cell.checkouts.load(Ordering::Acquire) == 0);

        match removed {
            Some((_, cell)) => {
                let children = std::mem::take(&mut cell.record.lock().references);
                self.back_refs.remove_object(id, children.iter().copied());
                self.tombstones.lock().add(id);
                RemoveOutcome::Removed(children)
            }
            None if self.records.contains_key(&id) => RemoveOutcome::CheckedOut,
            None => RemoveOutcome::Missing,
        }
    }

    /// Root table copy for a passive mirror.
    pub fn snapshot_roots(&self) -> RootSnapshot {
        self.roots.snapshot()
    }

    /// Cursor over every record, consistent with respect to the DGC.
    pub fn cursor(&self) -> RecordCursor<'_> {
        let guard = self.collection_lock.read();
        let mut cells: Vec<(ObjectId, Arc<RecordCell>)> = self
            .records
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        cells.sort_unstable_by_key(|(id, _)| *id);
        RecordCursor {
            _guard: guard,
            cells: cells.into_iter(),
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            objects: self.records.len(),
            outstanding_checkouts: self.outstanding_checkouts(),
            roots: self.roots.len(),
            back_reference_edges: self.back_refs.edge_count(),
            tombstones: self.tombstones.lock().ids.len(),
            next_object_id: self.next_id.load(Ordering::Acquire),
            ..StoreStats::default()
        };
        let cells: Vec<Arc<RecordCell>> = self
            .records
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for cell in cells {
            if cell.checkouts.load(Ordering::Acquire) > 0 {
                stats.checked_out_objects += 1;
            }
            let record = cell.record.lock();
            stats.new_objects += usize::from(record.is_new);
            stats.dirty_objects += usize::from(record.is_dirty);
        }
        stats
    }
}

/// Point-in-time iteration over records, in id order.
///
/// While a cursor is alive no DGC sweep can start, so every record it yields
/// is either fully present or was never collected mid-read.
pub struct RecordCursor<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    cells: std::vec::IntoIter<(ObjectId, Arc<RecordCell>)>,
}

impl Iterator for RecordCursor<'_> {
    type Item = Dna;

    fn next(&mut self) -> Option<Dna> {
        self.cells
            .next()
            .map(|(_, cell)| cell.record.lock().dehydrate())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.cells.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dso_common::LogicalOp;

    fn store() -> ObjectStore {
        ObjectStore::new(&ObjectManagerConfig::default())
    }

    fn node(id: u64) -> Dna {
        Dna::new_object(ObjectId::new(id), "Node")
    }

    #[test]
    fn test_create_checkout_release() {
        let store = store();
        let handle = store.create_object(&node(1).with_field("v", 1i64)).unwrap();
        assert_eq!(store.checkout_count(ObjectId::new(1)), Some(1));
        assert!(handle.with_record(|r| r.is_new()));

        let second = store.checkout(ObjectId::new(1)).unwrap();
        assert_eq!(store.outstanding_checkouts(), 2);
        store.release(handle);
        assert!(second.with_record(|r| r.is_new()));
        store.release(second);

        assert_eq!(store.outstanding_checkouts(), 0);
        let fresh = store.checkout(ObjectId::new(1)).unwrap();
        assert!(!fresh.with_record(|r| r.is_new()));
    }

    #[test]
    fn test_checkout_unknown_id() {
        let store = store();
        assert_eq!(
            store.checkout(ObjectId::new(9)).unwrap_err(),
            DsoError::NotFound(ObjectId::new(9))
        );
    }

    #[test]
    fn test_stale_delta_rejected_unless_forced() {
        let store = store();
        let handle = store.create_object(&node(1)).unwrap();
        assert_eq!(handle.version(), 1);

        let v = store
            .apply_delta(&handle, &Dna::delta(ObjectId::new(1), "Node").with_field("v", 1i64), 1, ApplyMode::Normal)
            .unwrap();
        assert_eq!(v, 2);

        let stale = Dna::delta(ObjectId::new(1), "Node").with_field("v", 2i64);
        assert!(matches!(
            store.apply_delta(&handle, &stale, 1, ApplyMode::Normal),
            Err(DsoError::StaleVersion { current: 2, attempted: 1, .. })
        ));
        assert_eq!(store.apply_delta(&handle, &stale, 1, ApplyMode::Forced).unwrap(), 3);
    }

    #[test]
    fn test_back_references_follow_deltas() {
        let store = store();
        let a = store.create_object(&node(1)).unwrap();
        let _b = store.create_object(&node(2)).unwrap();

        let version = store
            .apply_delta(&a, &Dna::delta(ObjectId::new(1), "Node").with_field("next", ObjectId::new(2)), 1, ApplyMode::Normal)
            .unwrap();
        assert!(store.back_refs().has_edge(ObjectId::new(1), ObjectId::new(2)));

        store
            .apply_delta(&a, &Dna::delta(ObjectId::new(1), "Node").with_field("next", Value::Null), version, ApplyMode::Normal)
            .unwrap();
        assert!(!store.back_refs().has_parents(ObjectId::new(2)));
    }

    #[test]
    fn test_remove_if_collectable_respects_checkouts() {
        let store = store();
        let handle = store.create_object(&node(1).with_field("self", ObjectId::new(1))).unwrap();
        assert!(matches!(store.remove_if_collectable(ObjectId::new(1)), RemoveOutcome::CheckedOut));

        store.release(handle);
        assert!(matches!(store.remove_if_collectable(ObjectId::new(1)), RemoveOutcome::Removed(_)));
        assert!(store.back_refs().is_empty());
        assert!(matches!(store.remove_if_collectable(ObjectId::new(1)), RemoveOutcome::Missing));
        assert_eq!(
            store.checkout(ObjectId::new(1)).unwrap_err(),
            DsoError::Tombstoned(ObjectId::new(1))
        );
        assert!(store.create_object(&node(1)).is_err());
    }

    #[test]
    fn test_tombstone_limit() {
        let config = ObjectManagerConfig {
            tombstone_limit: 1,
            ..ObjectManagerConfig::default()
        };
        let store = ObjectStore::new(&config);
        for id in 1..=2 {
            drop(store.create_object(&node(id)).unwrap());
            store.remove_if_collectable(ObjectId::new(id));
        }
        assert!(!store.is_tombstoned(ObjectId::new(1)));
        assert!(store.is_tombstoned(ObjectId::new(2)));
    }

    #[test]
    fn test_roots_require_live_object() {
        let store = store();
        assert!(store.create_root("app", ObjectId::new(1)).is_err());
        drop(store.create_object(&node(1)).unwrap());
        assert_eq!(store.create_root("app", ObjectId::new(1)).unwrap(), ObjectId::new(1));
        assert_eq!(store.lookup_root("app"), Some(ObjectId::new(1)));
    }

    #[test]
    fn test_map_reads() {
        let store = store();
        let map = Dna::new_object(ObjectId::new(1), "Map").with_logical(LogicalOp::MapPut {
            key: Value::from("k"),
            value: Value::Int(3),
        });
        drop(store.create_object(&map).unwrap());
        assert_eq!(store.map_get(ObjectId::new(1), &Value::from("k")).unwrap(), Some(Value::Int(3)));
        assert_eq!(store.map_get(ObjectId::new(1), &Value::from("x")).unwrap(), None);
    }

    #[test]
    fn test_cursor_and_allocation() {
        let store = store();
        let batch = store.allocate_ids(3);
        assert_eq!(batch.remaining(), 3);
        drop(store.create_object(&node(7)).unwrap());
        drop(store.create_object(&node(5)).unwrap());
        let ids: Vec<_> = store.cursor().map(|dna| dna.id.to_u64()).collect();
        assert_eq!(ids, vec![5, 7]);
        assert_eq!(store.next_object_id(), ObjectId::new(8));
    }

    #[test]
    fn test_stats() {
        let store = store();
        let handle = store.create_object(&node(1).with_field("next", ObjectId::new(2))).unwrap();
        let stats = store.stats();
        assert_eq!(stats.objects, 1);
        assert_eq!(stats.new_objects, 1);
        assert_eq!(stats.outstanding_checkouts, 1);
        assert_eq!(stats.back_reference_edges, 1);
        drop(handle);
        assert_eq!(store.stats().checked_out_objects, 0);
    }
}
