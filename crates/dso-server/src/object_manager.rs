//! Server-side object manager
//!
//! Ties the store, the client state manager and the collector together and
//! exposes the operations the transport layer calls on behalf of clients.

use crate::client_state::ClientStateManager;
use crate::config::ObjectManagerConfig;
use crate::dgc::{
    DgcResultContext, GarbageCollectorEventListener, GcKind, GcLogger, GcState, GcThread,
    MarkAndSweepGarbageCollector,
};
use crate::replication::ReplicationSnapshot;
use crate::roots::RootSnapshot;
use crate::store::{ApplyMode, ObjectStore, RecordCursor, StoreStats};
use dso_common::{ClientId, Dna, DsoResult, LockScope, LogicalOp, ObjectId, ObjectIdBatch, Value};
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// What a committed logical-map change touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapChange {
    /// These keys were put or removed
    Keys(Vec<Value>),
    /// The map was cleared
    Cleared,
}

impl MapChange {
    /// Summarise the map ops of a delta, `None` if it has none.
    pub fn from_dna(dna: &Dna) -> Option<Self> {
        let mut keys = IndexSet::new();
        let mut saw_map_op = false;
        for op in dna.logical_ops() {
            match op {
                LogicalOp::MapClear => return Some(MapChange::Cleared),
                op if op.is_map_op() => {
                    saw_map_op = true;
                    if let Some(key) = op.map_key() {
                        keys.insert(key.clone());
                    }
                }
                _ => {}
            }
        }
        saw_map_op.then(|| MapChange::Keys(keys.into_iter().collect()))
    }
}

/// Notified after every committed logical-map change.
pub trait MapChangeListener: Send + Sync {
    /// `origin` committed `change` to `map_id`.
    fn map_changed(&self, origin: ClientId, map_id: ObjectId, change: &MapChange);
}

/// Introspection data for operational tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectManagerStats {
    /// Store counters
    pub store: StoreStats,
    /// Connected clients
    pub clients: usize,
    /// Sum of per-client held ids
    pub client_references: usize,
    /// Collector state
    pub gc_state: GcState,
    /// Passes run
    pub gc_iterations: u64,
    /// Ids collected over all passes
    pub total_collected: u64,
    /// Objects awaiting a young pass
    pub young_gen_objects: usize,
    /// Most recent pass
    pub last_gc: Option<DgcResultContext>,
}

impl ObjectManagerStats {
    /// Pretty JSON rendering.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// The server's object manager.
pub struct ObjectManager {
    config: ObjectManagerConfig,
    store: Arc<ObjectStore>,
    client_state: Arc<ClientStateManager>,
    collector: Arc<MarkAndSweepGarbageCollector>,
    gc_thread: Mutex<Option<GcThread>>,
    map_listeners: RwLock<Vec<Arc<dyn MapChangeListener>>>,
}

impl std::fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectManager")
            .field("objects", &self.store.len())
            .field("collector", &self.collector)
            .finish_non_exhaustive()
    }
}

impl ObjectManager {
    /// Build a manager with an empty store.
    pub fn new(config: ObjectManagerConfig) -> Arc<Self> {
        let store = Arc::new(ObjectStore::new(&config));
        Self::with_store(config, store)
    }

    /// Build a manager around an existing store (e.g. one restored from a
    /// replication snapshot).
    pub fn with_store(config: ObjectManagerConfig, store: Arc<ObjectStore>) -> Arc<Self> {
        let client_state = Arc::new(ClientStateManager::new());
        let collector = Arc::new(MarkAndSweepGarbageCollector::new(
            Arc::clone(&store),
            Arc::clone(&client_state),
            true,
        ));
        if config.verbose_gc {
            collector.add_listener(Arc::new(GcLogger::new(true)));
        }
        Arc::new(Self {
            config,
            store,
            client_state,
            collector,
            gc_thread: Mutex::new(None),
            map_listeners: RwLock::new(Vec::new()),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &ObjectManagerConfig {
        &self.config
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Per-client held ids.
    pub fn client_state(&self) -> &Arc<ClientStateManager> {
        &self.client_state
    }

    /// The collector.
    pub fn collector(&self) -> &Arc<MarkAndSweepGarbageCollector> {
        &self.collector
    }

    /// Enable collection and, when configured, the periodic GC thread.
    pub fn start(&self) -> std::io::Result<()> {
        self.collector.start();
        if self.config.gc_enabled {
            let mut slot = self.gc_thread.lock();
            if slot.is_none() {
                *slot = Some(GcThread::spawn(
                    Arc::clone(&self.collector),
                    self.config.gc_interval(),
                    self.config.young_gen_interval(),
                )?);
            }
        }
        tracing::info!(
            target: "dso::store",
            periodic_gc = self.config.gc_enabled,
            young_gen = self.config.young_gen_enabled,
            "object manager started"
        );
        Ok(())
    }

    /// Stop the GC thread and refuse further passes.
    pub fn stop(&self) {
        if let Some(thread) = self.gc_thread.lock().take() {
            thread.stop();
        }
        self.collector.stop();
        tracing::info!(target: "dso::store", "object manager stopped");
    }

    /// Ask the GC thread for an immediate pass; runs inline without one.
    pub fn request_gc(&self, kind: GcKind) -> DsoResult<Option<DgcResultContext>> {
        if let Some(thread) = self.gc_thread.lock().as_ref() {
            thread.request_now(kind);
            return Ok(None);
        }
        self.collector.collect(kind).map(Some)
    }

    /// Run a full pass on the calling thread.
    pub fn gc(&self) -> DsoResult<DgcResultContext> {
        self.collector.gc()
    }

    /// Run a young-generation pass on the calling thread.
    pub fn gc_young(&self) -> DsoResult<DgcResultContext> {
        self.collector.gc_young()
    }

    /// Register a DGC listener.
    pub fn add_gc_listener(&self, listener: Arc<dyn GarbageCollectorEventListener>) {
        self.collector.add_listener(listener);
    }

    /// Register a map change listener.
    pub fn add_map_listener(&self, listener: Arc<dyn MapChangeListener>) {
        self.map_listeners.write().push(listener);
    }

    /// Hand out the configured number of fresh ids.
    pub fn allocate_id_batch(&self) -> ObjectIdBatch {
        self.store.allocate_ids(self.config.id_batch_size)
    }

    /// Hand out `count` fresh ids.
    pub fn allocate_ids(&self, count: u64) -> ObjectIdBatch {
        self.store.allocate_ids(count)
    }

    /// Create an object on behalf of `client`, who then holds it. A null id
    /// in `dna` gets a fresh one.
    pub fn create_object(&self, client: ClientId, mut dna: Dna) -> DsoResult<ObjectId> {
        if dna.id.is_null() {
            dna.id = self.store.next_object_id();
        }
        let handle = self.store.create_object(&dna)?;
        // Recorded while still checked out so no pass can miss it
        self.client_state.add_references(client, [dna.id]);
        self.store.release(handle);
        Ok(dna.id)
    }

    /// Apply a committed change from `client`. New-object DNA creates the
    /// object; deltas must be based on the record's current version.
    pub fn commit(
        &self,
        client: ClientId,
        dna: &Dna,
        transaction_version: u64,
        scope: &LockScope,
    ) -> DsoResult<u64> {
        if !dna.is_delta() {
            self.create_object(client, dna.clone())?;
            return Ok(dna.version + 1);
        }
        self.apply(client, dna, transaction_version, ApplyMode::Normal, scope)
    }

    /// Apply a delta regardless of version (administrative repair).
    pub fn commit_forced(&self, client: ClientId, dna: &Dna, scope: &LockScope) -> DsoResult<u64> {
        self.apply(client, dna, 0, ApplyMode::Forced, scope)
    }

    fn apply(
        &self,
        client: ClientId,
        dna: &Dna,
        transaction_version: u64,
        mode: ApplyMode,
        scope: &LockScope,
    ) -> DsoResult<u64> {
        let handle = self.store.checkout(dna.id)?;
        let version = self.store.apply_delta(&handle, dna, transaction_version, mode)?;
        self.client_state.add_references(client, [dna.id]);
        self.store.release(handle);

        tracing::trace!(
            target: "dso::store",
            client = client.0,
            id = dna.id.to_u64(),
            version,
            scope = %scope,
            "change committed"
        );

        if let Some(change) = MapChange::from_dna(dna) {
            let listeners = self.map_listeners.read().clone();
            for listener in &listeners {
                listener.map_changed(client, dna.id, &change);
            }
        }
        Ok(version)
    }

    /// Full-state DNA of `id` followed by up to `max_count - 1` neighbours
    /// `client` does not hold yet, breadth-first. `parent` is a prefetch
    /// hint: its other children are queued after those of `id`.
    pub fn fetch_objects(
        &self,
        client: ClientId,
        id: ObjectId,
        parent: Option<ObjectId>,
        max_count: usize,
    ) -> DsoResult<Vec<Dna>> {
        let max_count = if max_count == 0 {
            self.config.default_fault_depth
        } else {
            max_count
        }
        .max(1);

        // Sending and recording must not straddle a DGC pause
        let _guard = self.store.mutation_guard();
        let requested = self.store.snapshot_of(id)?;

        let mut sent = IndexSet::new();
        sent.insert(id);
        let mut visited = FxHashSet::default();
        visited.insert(id);
        let mut queue: VecDeque<ObjectId> = requested.references().into_iter().collect();
        if let Some(siblings) = parent.and_then(|parent| self.store.references_of(parent)) {
            queue.extend(siblings);
        }

        let mut objects = vec![requested];
        while objects.len() < max_count {
            let Some(next) = queue.pop_front() else {
                break;
            };
            if !visited.insert(next) {
                continue;
            }
            if self.client_state.has_reference(client, next) {
                // Already resident on the client; look past it
                if let Some(children) = self.store.references_of(next) {
                    queue.extend(children);
                }
                continue;
            }
            // Dangling or concurrently collected references are skipped
            let Ok(dna) = self.store.snapshot_of(next) else {
                continue;
            };
            sent.insert(next);
            queue.extend(dna.references());
            objects.push(dna);
        }

        self.client_state.add_references(client, sent.iter().copied());
        tracing::debug!(
            target: "dso::store",
            client = client.0,
            id = id.to_u64(),
            sent = objects.len(),
            "objects faulted"
        );
        Ok(objects)
    }

    /// `client` no longer holds these ids.
    pub fn release_client_references(
        &self,
        client: ClientId,
        ids: impl IntoIterator<Item = ObjectId>,
    ) -> usize {
        self.client_state.remove_references(client, ids)
    }

    /// Register a client.
    pub fn client_connected(&self, client: ClientId) {
        self.client_state.add_client(client);
        tracing::debug!(target: "dso::store", client = client.0, "client connected");
    }

    /// Drop everything a departed client held.
    pub fn client_disconnected(&self, client: ClientId) {
        let held = self.client_state.remove_client(client).map_or(0, |ids| ids.len());
        tracing::debug!(target: "dso::store", client = client.0, held, "client disconnected");
    }

    /// Resolve a root.
    pub fn lookup_root(&self, name: &str) -> Option<ObjectId> {
        self.store.lookup_root(name)
    }

    /// Bind a root unless bound; returns the bound id.
    pub fn create_root(&self, name: &str, id: ObjectId) -> DsoResult<ObjectId> {
        self.store.create_root(name, id)
    }

    /// Bind or rebind a root; returns the previous id.
    pub fn create_or_replace_root(&self, name: &str, id: ObjectId) -> DsoResult<Option<ObjectId>> {
        self.store.create_or_replace_root(name, id)
    }

    /// Root names, sorted.
    pub fn root_names(&self) -> Vec<String> {
        self.store.roots().root_names()
    }

    /// Read one map entry for `client`. A referenced value becomes held by
    /// the client.
    pub fn map_get(&self, client: ClientId, map_id: ObjectId, key: &Value) -> DsoResult<Option<Value>> {
        let _guard = self.store.mutation_guard();
        let value = self.store.map_get(map_id, key)?;
        if let Some(value) = &value {
            let mut refs = Vec::new();
            value.collect_references(&mut refs);
            if !refs.is_empty() {
                self.client_state.add_references(client, refs);
            }
        }
        Ok(value)
    }

    /// Entry count of a map.
    pub fn map_size(&self, map_id: ObjectId) -> DsoResult<usize> {
        self.store.map_size(map_id)
    }

    /// Keys of a map.
    pub fn map_keys(&self, map_id: ObjectId) -> DsoResult<Vec<Value>> {
        self.store.map_keys(map_id)
    }

    /// Root table copy for a passive mirror.
    pub fn snapshot_roots(&self) -> RootSnapshot {
        self.store.snapshot_roots()
    }

    /// DGC-consistent iteration over every record.
    pub fn records_cursor(&self) -> RecordCursor<'_> {
        self.store.cursor()
    }

    /// Whole-store snapshot for a passive mirror.
    pub fn replication_snapshot(&self) -> ReplicationSnapshot {
        ReplicationSnapshot::capture(&self.store)
    }

    /// Operational statistics.
    pub fn dump(&self) -> ObjectManagerStats {
        ObjectManagerStats {
            store: self.store.stats(),
            clients: self.client_state.client_count(),
            client_references: self.client_state.reference_count(),
            gc_state: self.collector.state(),
            gc_iterations: self.collector.iteration(),
            total_collected: self.collector.total_collected(),
            young_gen_objects: self.store.young_gen().len(),
            last_gc: self.collector.last_result(),
        }
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        if let Some(thread) = self.gc_thread.get_mut().take() {
            thread.stop();
        }
    }
}
