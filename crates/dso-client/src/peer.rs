//! Local peers and their proxies

use crate::shared::SharedObject;
use crossbeam_channel::Sender;
use dso_common::{DnaAction, ObjectId, Value};
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// The local instance of a shared object.
///
/// Application code holds peers through `Arc<Peer>`. When the last handle
/// goes away the id is pushed onto the owning manager's cleanup queue so
/// its proxy can be dropped.
pub struct Peer {
    id: OnceLock<ObjectId>,
    class_name: String,
    object: RwLock<Box<dyn SharedObject>>,
    cleanup: Sender<ObjectId>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id.get())
            .field("class_name", &self.class_name)
            .finish()
    }
}

impl Peer {
    pub(crate) fn unshared(object: Box<dyn SharedObject>, cleanup: Sender<ObjectId>) -> Self {
        Self {
            id: OnceLock::new(),
            class_name: object.class_name().to_string(),
            object: RwLock::new(object),
            cleanup,
        }
    }

    pub(crate) fn faulted(id: ObjectId, object: Box<dyn SharedObject>, cleanup: Sender<ObjectId>) -> Self {
        let peer = Self::unshared(object, cleanup);
        let _ = peer.id.set(id);
        peer
    }

    /// Assigned id, `None` until the peer is shared.
    pub fn id(&self) -> Option<ObjectId> {
        self.id.get().copied()
    }

    pub(crate) fn bind_id(&self, id: ObjectId) -> bool {
        self.id.set(id).is_ok()
    }

    /// Class descriptor.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Shared read access to the object.
    pub fn object(&self) -> RwLockReadGuard<'_, Box<dyn SharedObject>> {
        self.object.read()
    }

    /// Exclusive access to the object. Changes reach the cluster on commit.
    pub fn object_mut(&self) -> RwLockWriteGuard<'_, Box<dyn SharedObject>> {
        self.object.write()
    }

    /// Read the object as `T`; `None` if it is some other type.
    pub fn read<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let object = self.object.read();
        object.as_any().downcast_ref::<T>().map(f)
    }

    /// Mutate the object as `T`; `None` if it is some other type.
    pub fn write<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut object = self.object.write();
        object.as_any_mut().downcast_mut::<T>().map(f)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(id) = self.id.get() {
            let _ = self.cleanup.send(*id);
        }
    }
}

/// Per-id bookkeeping kept by the client object manager.
///
/// Holds its peer weakly: a proxy never keeps an instance alive.
pub struct ObjectProxy {
    id: ObjectId,
    class_name: String,
    peer: RwLock<Weak<Peer>>,
    version: AtomicU64,
    baseline: Mutex<IndexMap<String, Value>>,
}

impl fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("id", &self.id)
            .field("class_name", &self.class_name)
            .field("version", &self.version())
            .field("live", &self.is_live())
            .finish()
    }
}

impl ObjectProxy {
    pub(crate) fn new(id: ObjectId, peer: &Arc<Peer>, version: u64, shipped: &[DnaAction]) -> Self {
        let proxy = Self {
            id,
            class_name: peer.class_name().to_string(),
            peer: RwLock::new(Arc::downgrade(peer)),
            version: AtomicU64::new(version),
            baseline: Mutex::new(IndexMap::new()),
        };
        record_shipped(&mut proxy.baseline.lock(), shipped);
        proxy
    }

    /// Object id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Class descriptor.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Version the local state was last synchronised with.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }

    /// The live peer, if the application still holds one.
    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.peer.read().upgrade()
    }

    /// Whether the peer is still alive.
    pub fn is_live(&self) -> bool {
        self.peer.read().strong_count() > 0
    }

    /// Attach a freshly faulted peer to a proxy whose previous peer died.
    pub(crate) fn rebind(&self, peer: &Arc<Peer>, version: u64, shipped: &[DnaAction]) {
        let mut baseline = self.baseline.lock();
        baseline.clear();
        record_shipped(&mut baseline, shipped);
        *self.peer.write() = Arc::downgrade(peer);
        self.set_version(version);
    }

    /// Field values as last shipped to (or received from) the server.
    /// Holding the guard serialises commits of this object.
    pub(crate) fn baseline(&self) -> MutexGuard<'_, IndexMap<String, Value>> {
        self.baseline.lock()
    }
}

pub(crate) fn record_shipped(baseline: &mut IndexMap<String, Value>, shipped: &[DnaAction]) {
    for action in shipped {
        if let DnaAction::Physical { field, value } = action {
            baseline.insert(field.clone(), value.clone());
        }
    }
}
