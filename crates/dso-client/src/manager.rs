//! Client object manager: identity map, fault-in, commit and cleanup

use crate::config::ClientConfig;
use crate::peer::{ObjectProxy, Peer, record_shipped};
use crate::periodic::PeriodicTask;
use crate::prefetch::PrefetchCache;
use crate::remote::RemoteObjectManager;
use crate::shared::{ClassRegistry, Reference, SharedObject};
use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;
use dso_common::{
    ClientId, Dna, DnaAction, DnaKind, DnaWriter, DsoError, DsoResult, LockScope, LogicalOp,
    ObjectId, ObjectIdBatch, ObjectIdSet,
};
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Blocks concurrent lookups of an id while one thread faults it in.
struct LookupLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl LookupLatch {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    fn open(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

/// Introspection snapshot of a client object manager.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    /// This process
    pub client: ClientId,
    /// Registered proxies
    pub proxies: usize,
    /// Proxies whose peer is still alive
    pub live_peers: usize,
    /// Prefetched records not yet faulted in
    pub prefetched: usize,
    /// Ids known to be collected
    pub tombstoned: usize,
    /// Cached root bindings
    pub cached_roots: usize,
    /// Fault-in round trips to the server
    pub faults: u64,
    /// Proxies removed by cleanup
    pub cleaned: u64,
    /// Resolved references dropped under memory pressure
    pub cleared: u64,
    /// Cleanup thread state
    pub cleaner_running: bool,
}

impl ClientStats {
    /// Pretty JSON for dump tooling.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Maps live peers to object ids for one process.
///
/// At most one peer exists per id at a time. Proxies hold their peers
/// weakly; once the application drops a peer its id arrives on the cleanup
/// queue, and [`run_cleanup`](Self::run_cleanup) removes the proxy and tells
/// the server this process no longer holds the object.
///
/// Every record the server sends counts as held by this process until it is
/// released. Releases are sent with `releasing` held for writing and fetches
/// run with it held for reading, so a release never overtakes a fetch that
/// brought the same id back.
pub struct ClientObjectManager {
    client: ClientId,
    config: ClientConfig,
    remote: Arc<dyn RemoteObjectManager>,
    classes: ClassRegistry,
    proxies: DashMap<ObjectId, Arc<ObjectProxy>, FxBuildHasher>,
    prefetched: Mutex<PrefetchCache>,
    pending: Mutex<FxHashMap<ObjectId, Arc<LookupLatch>>>,
    tombstones: RwLock<ObjectIdSet>,
    roots: RwLock<FxHashMap<String, ObjectId>>,
    ids: Mutex<ObjectIdBatch>,
    cleanup_tx: Sender<ObjectId>,
    cleanup_rx: Receiver<ObjectId>,
    releasing: RwLock<()>,
    deferred_releases: Mutex<Vec<ObjectId>>,
    cleaner: Mutex<Option<PeriodicTask>>,
    faults: AtomicU64,
    cleaned: AtomicU64,
    cleared: AtomicU64,
}

impl std::fmt::Debug for ClientObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientObjectManager")
            .field("client", &self.client)
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

impl ClientObjectManager {
    /// Create a manager for `client`.
    pub fn new(
        client: ClientId,
        config: ClientConfig,
        remote: Arc<dyn RemoteObjectManager>,
        classes: ClassRegistry,
    ) -> Arc<Self> {
        let (cleanup_tx, cleanup_rx) = unbounded();
        let prefetched = PrefetchCache::new(config.max_prefetched_batches);
        Arc::new(Self {
            client,
            config,
            remote,
            classes,
            proxies: DashMap::with_hasher(FxBuildHasher),
            prefetched: Mutex::new(prefetched),
            pending: Mutex::new(FxHashMap::default()),
            tombstones: RwLock::new(ObjectIdSet::new()),
            roots: RwLock::new(FxHashMap::default()),
            ids: Mutex::new(ObjectIdBatch::empty()),
            cleanup_tx,
            cleanup_rx,
            releasing: RwLock::new(()),
            deferred_releases: Mutex::new(Vec::new()),
            cleaner: Mutex::new(None),
            faults: AtomicU64::new(0),
            cleaned: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
        })
    }

    /// This process's id.
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start the reference cleaner thread.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let mut cleaner = self.cleaner.lock();
        if cleaner.is_some() {
            return Ok(());
        }
        let manager: Weak<Self> = Arc::downgrade(self);
        *cleaner = Some(PeriodicTask::spawn(
            "dso-reference-cleaner",
            self.config.cleanup_interval(),
            move || match manager.upgrade() {
                Some(manager) => {
                    manager.run_cleanup();
                    manager.expire_prefetched();
                    true
                }
                None => false,
            },
        )?);
        tracing::debug!(target: "dso::client", client = %self.client, "reference cleaner started");
        Ok(())
    }

    /// Stop the reference cleaner thread.
    pub fn stop(&self) {
        let cleaner = self.cleaner.lock().take();
        if let Some(cleaner) = cleaner {
            cleaner.stop();
        }
    }

    // =========================================================================
    // Sharing
    // =========================================================================

    /// Wrap an application object in a peer. It is not shared until passed
    /// to [`lookup_or_create`](Self::lookup_or_create) or referenced from a
    /// shared object.
    pub fn new_peer(&self, object: impl SharedObject) -> Arc<Peer> {
        Arc::new(Peer::unshared(Box::new(object), self.cleanup_tx.clone()))
    }

    /// Wrap and share in one step.
    pub fn share(&self, object: impl SharedObject) -> DsoResult<Arc<Peer>> {
        let peer = self.new_peer(object);
        self.lookup_or_create(&peer)?;
        Ok(peer)
    }

    /// The proxy for `peer`, sharing it first if needed. Idempotent.
    pub fn lookup_or_create(&self, peer: &Arc<Peer>) -> DsoResult<Arc<ObjectProxy>> {
        if let Some(id) = peer.id() {
            return self.proxy_of(id);
        }

        let id = self.next_object_id()?;
        let mut writer = DnaWriter::new();
        peer.object().dehydrate(&mut writer);
        let dna = writer.into_dna(id, peer.class_name(), DnaKind::New);
        let proxy = Arc::new(ObjectProxy::new(id, peer, 1, &dna.actions));

        self.remote.create_object(self.client, dna)?;
        self.proxies.insert(id, Arc::clone(&proxy));

        if !peer.bind_id(id) {
            // Shared concurrently by another thread; ours is garbage
            self.proxies.remove(&id);
            if let Err(e) = self.remote.release_references(self.client, &[id]) {
                tracing::warn!(target: "dso::client", %id, error = %e, "failed to release duplicate object");
            }
            return match peer.id() {
                Some(winner) => self.proxy_of(winner),
                None => Err(DsoError::NotFound(id)),
            };
        }

        tracing::trace!(target: "dso::client", %id, class = peer.class_name(), "shared new object");
        Ok(proxy)
    }

    /// A reference field pointing at `peer`, sharing it if needed.
    pub fn reference_to(&self, peer: &Arc<Peer>) -> DsoResult<Reference> {
        let proxy = self.lookup_or_create(peer)?;
        Ok(Reference::resolved(proxy.id(), Arc::clone(peer)))
    }

    fn proxy_of(&self, id: ObjectId) -> DsoResult<Arc<ObjectProxy>> {
        match self.proxies.get(&id) {
            Some(proxy) => Ok(Arc::clone(proxy.value())),
            None if self.tombstones.read().contains(id) => Err(DsoError::Tombstoned(id)),
            None => Err(DsoError::NotFound(id)),
        }
    }

    fn next_object_id(&self) -> DsoResult<ObjectId> {
        let mut batch = self.ids.lock();
        if let Some(id) = batch.next_id() {
            return Ok(id);
        }
        *batch = self.remote.allocate_ids()?;
        batch
            .next_id()
            .ok_or_else(|| DsoError::Transport("server returned an empty id batch".to_string()))
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// The peer for `id`, faulting it in if needed. References up to
    /// `fault_depth` hops away are resolved eagerly, the rest on demand.
    pub fn lookup_object(&self, id: ObjectId) -> DsoResult<Arc<Peer>> {
        self.lookup(id, None, self.config.fault_depth)
    }

    /// Like [`lookup_object`](Self::lookup_object), naming the object whose
    /// field led here so the server can prefetch its siblings.
    pub fn lookup_object_with_parent(&self, id: ObjectId, parent: ObjectId) -> DsoResult<Arc<Peer>> {
        self.lookup(id, Some(parent), self.config.fault_depth)
    }

    /// Fault in the whole subgraph reachable from `id`.
    pub fn lookup_object_no_depth(&self, id: ObjectId) -> DsoResult<Arc<Peer>> {
        self.lookup(id, None, usize::MAX)
    }

    /// The resident proxy for `id`. Never contacts the server.
    pub fn lookup_if_local(&self, id: ObjectId) -> Option<Arc<ObjectProxy>> {
        self.proxies.get(&id).map(|proxy| Arc::clone(proxy.value()))
    }

    /// The live local peer for `id`. Never contacts the server.
    pub fn local_peer(&self, id: ObjectId) -> Option<Arc<Peer>> {
        self.proxies.get(&id).and_then(|proxy| proxy.peer())
    }

    /// Attach the peer a reference points at, faulting it in if needed.
    pub fn resolve(&self, reference: &mut Reference) -> DsoResult<Arc<Peer>> {
        if let Some(peer) = reference.get() {
            return Ok(Arc::clone(peer));
        }
        if reference.is_null() {
            return Err(DsoError::NotFound(reference.id()));
        }
        let peer = self.fault(reference.id(), None)?;
        reference.attach(Arc::clone(&peer));
        Ok(peer)
    }

    fn lookup(&self, id: ObjectId, parent: Option<ObjectId>, depth: usize) -> DsoResult<Arc<Peer>> {
        let peer = self.fault(id, parent)?;
        if depth > 0 {
            self.resolve_subgraph(&peer, depth)?;
        }
        Ok(peer)
    }

    /// Exactly one thread materialises a missing id; others wait on its
    /// latch and then find the peer resident.
    fn fault(&self, id: ObjectId, parent: Option<ObjectId>) -> DsoResult<Arc<Peer>> {
        if id.is_null() {
            return Err(DsoError::NotFound(id));
        }
        loop {
            if let Some(peer) = self.local_peer(id) {
                return Ok(peer);
            }
            if self.tombstones.read().contains(id) {
                return Err(DsoError::Tombstoned(id));
            }

            let waiting = {
                let mut pending = self.pending.lock();
                match pending.get(&id) {
                    Some(latch) => Some(Arc::clone(latch)),
                    None => {
                        pending.insert(id, Arc::new(LookupLatch::new()));
                        None
                    }
                }
            };
            if let Some(latch) = waiting {
                latch.wait();
                continue;
            }

            let _latch = scopeguard::guard(id, |id| {
                if let Some(latch) = self.pending.lock().remove(&id) {
                    latch.open();
                }
            });
            // Someone may have finished between the check and taking the latch
            if let Some(peer) = self.local_peer(id) {
                return Ok(peer);
            }
            let _fetching = self.releasing.read();
            return self.materialize(id, parent);
        }
    }

    fn materialize(&self, id: ObjectId, parent: Option<ObjectId>) -> DsoResult<Arc<Peer>> {
        let dna = self.take_record(id, parent)?;
        let object = self.classes.instantiate(&dna.class_name).and_then(|mut object| {
            object.hydrate(&dna)?;
            Ok(object)
        });
        let object = match object {
            Ok(object) => object,
            Err(e) => {
                // The server already counts the record as held here
                self.release_later([id]);
                tracing::debug!(target: "dso::client", %id, class = %dna.class_name, error = %e, "fault-in abandoned");
                return Err(e);
            }
        };

        let peer = Arc::new(Peer::faulted(id, object, self.cleanup_tx.clone()));
        match self.proxies.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                entry.get().rebind(&peer, dna.version, &dna.actions);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(ObjectProxy::new(id, &peer, dna.version, &dna.actions)));
            }
        }
        tracing::trace!(target: "dso::client", %id, class = %dna.class_name, version = dna.version, "faulted in");
        Ok(peer)
    }

    /// The record for `id`: prefetched if available, else one round trip
    /// whose extra records are kept for later lookups.
    fn take_record(&self, id: ObjectId, parent: Option<ObjectId>) -> DsoResult<Dna> {
        if let Some(dna) = self.prefetched.lock().take(id) {
            return Ok(dna);
        }

        let records = self
            .remote
            .fetch_objects(self.client, id, parent, self.config.max_fault_count)?;
        self.faults.fetch_add(1, Ordering::Relaxed);

        let mut records = records.into_iter();
        let first = records.next();
        let evicted = self
            .prefetched
            .lock()
            .add_batch(records.filter(|dna| !self.proxies.contains_key(&dna.id)));
        self.release_later(evicted);

        match first {
            Some(dna) if dna.id == id => Ok(dna),
            other => {
                self.release_later(other.map(|dna| dna.id));
                Err(DsoError::NotFound(id))
            }
        }
    }

    /// Breadth-first resolution of reference fields up to `depth` hops.
    /// Object locks are never nested: targets are collected under one lock,
    /// faulted with none held, then attached under a second lock.
    fn resolve_subgraph(&self, root: &Arc<Peer>, depth: usize) -> DsoResult<()> {
        let mut visited = FxHashSet::default();
        visited.extend(root.id());
        let mut queue = VecDeque::from([(Arc::clone(root), 0usize)]);

        while let Some((current, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }

            let mut targets: Vec<(ObjectId, Option<Arc<Peer>>)> = Vec::new();
            current.object_mut().visit_references(&mut |reference| {
                if !reference.is_null() {
                    targets.push((reference.id(), reference.get().cloned()));
                }
            });

            let mut faulted: FxHashMap<ObjectId, Arc<Peer>> = FxHashMap::default();
            for (child, resolved) in targets {
                let peer = match resolved {
                    Some(peer) => peer,
                    None => match self.fault(child, current.id()) {
                        Ok(peer) => {
                            faulted.insert(child, Arc::clone(&peer));
                            peer
                        }
                        Err(DsoError::Tombstoned(_) | DsoError::NotFound(_)) => {
                            tracing::debug!(target: "dso::client", %child, "skipping dangling reference");
                            continue;
                        }
                        Err(e) => return Err(e),
                    },
                };
                if visited.insert(child) {
                    queue.push_back((peer, level + 1));
                }
            }

            if !faulted.is_empty() {
                current.object_mut().visit_references(&mut |reference| {
                    if !reference.is_resolved() {
                        if let Some(peer) = faulted.get(&reference.id()) {
                            reference.attach(Arc::clone(peer));
                        }
                    }
                });
            }
        }
        Ok(())
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Ship the fields of `peer` that changed since they were last shipped.
    /// Shares the peer first if needed. Returns the object's version.
    pub fn commit(&self, peer: &Arc<Peer>, scope: &LockScope) -> DsoResult<u64> {
        let proxy = self.lookup_or_create(peer)?;
        let mut baseline = proxy.baseline();

        let mut writer = DnaWriter::new();
        peer.object().dehydrate(&mut writer);

        let version = proxy.version();
        let mut delta = Dna::delta(proxy.id(), proxy.class_name()).with_version(version);
        for action in writer.actions() {
            if let DnaAction::Physical { field, value } = action {
                if baseline.get(field) != Some(value) {
                    delta.actions.push(action.clone());
                }
            }
        }
        if delta.actions.is_empty() {
            return Ok(version);
        }

        let new_version = self.remote.commit(self.client, &delta, version, scope)?;
        record_shipped(&mut baseline, &delta.actions);
        proxy.set_version(new_version);
        tracing::trace!(target: "dso::client", id = %proxy.id(), fields = delta.actions.len(), version = new_version, "committed");
        Ok(new_version)
    }

    /// Ship one collection operation, then apply it locally. If the local
    /// object rejects an operation the server took, it is reloaded from the
    /// server before the error is returned.
    pub fn invoke_logical(&self, peer: &Arc<Peer>, op: LogicalOp, scope: &LockScope) -> DsoResult<u64> {
        let proxy = self.lookup_or_create(peer)?;
        let serial = proxy.baseline();

        let version = proxy.version();
        let delta = Dna::delta(proxy.id(), proxy.class_name())
            .with_version(version)
            .with_logical(op.clone());
        let new_version = self.remote.commit(self.client, &delta, version, scope)?;
        let applied = peer.object_mut().apply_logical(&op);
        proxy.set_version(new_version);
        drop(serial);

        if let Err(e) = applied {
            tracing::warn!(target: "dso::client", id = %proxy.id(), error = %e, "logical op rejected locally, reloading");
            if let Err(refresh) = self.refresh(peer) {
                tracing::warn!(target: "dso::client", id = %proxy.id(), error = %refresh, "reload failed");
            }
            return Err(e);
        }
        Ok(new_version)
    }

    /// Reload `peer` from the server's current state, e.g. after a stale
    /// commit.
    pub fn refresh(&self, peer: &Arc<Peer>) -> DsoResult<()> {
        let proxy = self.lookup_or_create(peer)?;
        let id = proxy.id();
        let dna = self
            .remote
            .fetch_objects(self.client, id, None, 1)?
            .into_iter()
            .next()
            .filter(|dna| dna.id == id)
            .ok_or(DsoError::NotFound(id))?;
        self.faults.fetch_add(1, Ordering::Relaxed);

        let mut baseline = proxy.baseline();
        peer.object_mut().hydrate(&dna)?;
        baseline.clear();
        record_shipped(&mut baseline, &dna.actions);
        proxy.set_version(dna.version);
        Ok(())
    }

    // =========================================================================
    // Roots
    // =========================================================================

    /// The peer bound to root `name`.
    pub fn lookup_root(&self, name: &str) -> DsoResult<Option<Arc<Peer>>> {
        let cached = self.roots.read().get(name).copied();
        let id = match cached {
            Some(id) => id,
            None => match self.remote.lookup_root(name)? {
                Some(id) => {
                    self.roots.write().insert(name.to_string(), id);
                    id
                }
                None => return Ok(None),
            },
        };
        self.lookup_object(id).map(Some)
    }

    /// Bind root `name` to `peer`, sharing it if needed.
    pub fn create_or_replace_root(&self, name: &str, peer: &Arc<Peer>) -> DsoResult<ObjectId> {
        let id = self.lookup_or_create(peer)?.id();
        self.remote.create_or_replace_root(name, id)?;
        self.roots.write().insert(name.to_string(), id);
        Ok(id)
    }

    /// Forget the cached binding of `name`; the next lookup asks the server.
    pub fn forget_root(&self, name: &str) {
        self.roots.write().remove(name);
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Drain the cleanup queue: drop proxies whose peer died and, when
    /// configured, tell the server, together with any abandoned fault-ins
    /// and evicted prefetches. Returns the number of proxies removed.
    pub fn run_cleanup(&self) -> usize {
        // Also keeps callers that find the queue empty from overtaking a
        // drain that has not reached the server yet
        let _releasing = self.releasing.write();
        let mut released = Vec::new();
        for id in self.cleanup_rx.try_iter() {
            // A newer peer may have been faulted in for the same id
            if self.proxies.remove_if(&id, |_, proxy| !proxy.is_live()).is_some() {
                released.push(id);
            }
        }
        let removed = released.len();

        let deferred = std::mem::take(&mut *self.deferred_releases.lock());
        if !deferred.is_empty() {
            let prefetched = self.prefetched.lock();
            released.extend(
                deferred
                    .into_iter()
                    .filter(|id| !self.proxies.contains_key(id) && !prefetched.contains(*id)),
            );
        }
        if released.is_empty() {
            return 0;
        }

        self.cleaned.fetch_add(removed as u64, Ordering::Relaxed);
        self.notify_released(&released);
        tracing::debug!(target: "dso::client", client = %self.client, removed, released = released.len(), "cleaned up proxies");
        removed
    }

    /// Drop prefetched records nobody faulted in since the previous call
    /// and release them on the server. Run by the reference cleaner each
    /// interval, so an unused record lives at most two intervals. Returns the
    /// number of records dropped.
    pub fn expire_prefetched(&self) -> usize {
        let _releasing = self.releasing.write();
        let expired = self.prefetched.lock().expire();
        if expired.is_empty() {
            return 0;
        }
        self.notify_released(&expired);
        tracing::debug!(target: "dso::client", client = %self.client, expired = expired.len(), "expired prefetched records");
        expired.len()
    }

    /// Unresolve the reference fields of up to `max` resident peers so that
    /// unreferenced peers (cycles included) can die, and drop prefetched
    /// records. Returns the number of references cleared.
    pub fn clear_references(&self, max: usize) -> usize {
        let peers: Vec<Arc<Peer>> = self
            .proxies
            .iter()
            .filter_map(|proxy| proxy.peer())
            .take(max)
            .collect();

        let mut cleared = 0;
        for peer in &peers {
            peer.object_mut().visit_references(&mut |reference| {
                if reference.clear() {
                    cleared += 1;
                }
            });
        }
        drop(peers);

        let dropped = {
            let _releasing = self.releasing.write();
            let dropped = self.prefetched.lock().drain();
            self.notify_released(&dropped);
            dropped
        };

        self.cleared.fetch_add(cleared as u64, Ordering::Relaxed);
        tracing::debug!(target: "dso::client", cleared, prefetched = dropped.len(), "cleared references");
        cleared
    }

    /// The server collected `ids`: forget them and report them as
    /// tombstoned from now on. Returns the number of proxies dropped.
    pub fn handle_objects_collected(&self, ids: &ObjectIdSet) -> usize {
        let mut removed = 0;
        {
            let mut prefetched = self.prefetched.lock();
            for id in ids.iter() {
                if self.proxies.remove(&id).is_some() {
                    removed += 1;
                }
                prefetched.remove(id);
            }
        }
        self.tombstones.write().union_with(ids);
        self.roots.write().retain(|_, id| !ids.contains(*id));
        if removed > 0 {
            tracing::debug!(target: "dso::client", client = %self.client, removed, "dropped collected objects");
        }
        removed
    }

    /// Whether `id` is known to be collected.
    pub fn is_tombstoned(&self, id: ObjectId) -> bool {
        self.tombstones.read().contains(id)
    }

    /// Queue ids for release by the next [`run_cleanup`](Self::run_cleanup).
    fn release_later(&self, ids: impl IntoIterator<Item = ObjectId>) {
        self.deferred_releases.lock().extend(ids);
    }

    fn notify_released(&self, ids: &[ObjectId]) {
        if ids.is_empty() || !self.config.notify_server_on_cleanup {
            return;
        }
        if let Err(e) = self.remote.release_references(self.client, ids) {
            tracing::warn!(target: "dso::client", count = ids.len(), error = %e, "failed to release references");
        }
    }

    /// Introspection snapshot.
    pub fn dump(&self) -> ClientStats {
        ClientStats {
            client: self.client,
            proxies: self.proxies.len(),
            live_peers: self.proxies.iter().filter(|proxy| proxy.is_live()).count(),
            prefetched: self.prefetched.lock().len(),
            tombstoned: self.tombstones.read().len(),
            cached_roots: self.roots.read().len(),
            faults: self.faults.load(Ordering::Relaxed),
            cleaned: self.cleaned.load(Ordering::Relaxed),
            cleared: self.cleared.load(Ordering::Relaxed),
            cleaner_running: self.cleaner.lock().as_ref().is_some_and(PeriodicTask::is_running),
        }
    }
}

impl Drop for ClientObjectManager {
    fn drop(&mut self) {
        self.stop();
    }
}
