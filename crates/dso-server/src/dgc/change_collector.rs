//! Change collectors feeding the DGC
//!
//! Both play the role a write barrier plays in a local collector:
//! - [`NewReferenceCollector`] remembers every reference added while a pass
//!   is marking, so the rescue phase can mark it before anything is deleted
//! - [`YoungGenChangeCollector`] remembers ids created since the last young
//!   pass, which become that pass's candidates

use dso_common::{ObjectId, ObjectIdSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Records referenced ids while a DGC pass is monitoring.
#[derive(Debug, Default)]
pub struct NewReferenceCollector {
    monitoring: AtomicBool,
    added: Mutex<ObjectIdSet>,
}

impl NewReferenceCollector {
    /// Create an idle collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording. Anything left from an earlier pass is discarded.
    pub fn start_monitoring(&self) {
        let mut added = self.added.lock();
        added.clear();
        self.monitoring.store(true, Ordering::Release);
    }

    /// Stop recording and discard what was recorded.
    pub fn stop_monitoring(&self) {
        let mut added = self.added.lock();
        self.monitoring.store(false, Ordering::Release);
        added.clear();
    }

    /// Whether a pass is monitoring.
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    /// Record newly referenced ids. No-op outside a pass.
    pub fn record(&self, ids: impl IntoIterator<Item = ObjectId>) {
        if !self.is_monitoring() {
            return;
        }
        let mut added = self.added.lock();
        // Re-check under the lock so a concurrent stop is not undone
        if self.monitoring.load(Ordering::Acquire) {
            added.extend(ids);
        }
    }

    /// Take what has been recorded so far, leaving monitoring on.
    pub fn take(&self) -> ObjectIdSet {
        std::mem::take(&mut *self.added.lock())
    }
}

/// Tracks objects created since they were last promoted.
#[derive(Debug)]
pub struct YoungGenChangeCollector {
    enabled: bool,
    young: Mutex<ObjectIdSet>,
}

impl YoungGenChangeCollector {
    /// Create a collector. When disabled nothing is ever tracked.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            young: Mutex::new(ObjectIdSet::new()),
        }
    }

    /// Whether young-generation tracking is on.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Remember a freshly created object.
    pub fn object_created(&self, id: ObjectId) {
        if self.enabled {
            self.young.lock().insert(id);
        }
    }

    /// Current young set.
    pub fn candidates(&self) -> ObjectIdSet {
        self.young.lock().clone()
    }

    /// Number of young objects.
    pub fn len(&self) -> usize {
        self.young.lock().len()
    }

    /// Whether the young set is empty.
    pub fn is_empty(&self) -> bool {
        self.young.lock().is_empty()
    }

    /// Drop ids a pass has decided on: survivors move to the old
    /// generation, collected ids are gone.
    pub fn promote(&self, candidates: &ObjectIdSet) {
        self.young.lock().subtract(candidates);
    }

    /// Forget collected ids after a full pass; survivors stay young.
    pub fn remove_garbage(&self, collected: &ObjectIdSet) {
        self.young.lock().subtract(collected);
    }
}
