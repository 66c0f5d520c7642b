//! State export for a passive mirror
//!
//! A snapshot is the root table plus every record's full-state DNA, taken
//! through a [`RecordCursor`](crate::store::RecordCursor) so no DGC sweep can
//! interleave with it. Shipping it and keeping the mirror current is the
//! replication layer's business; this module only produces and installs it.

use crate::config::ObjectManagerConfig;
use crate::roots::RootSnapshot;
use crate::store::ObjectStore;
use dso_common::{Dna, DsoError, DsoResult};
use serde::{Deserialize, Serialize};

/// Serializable copy of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSnapshot {
    /// Root bindings
    pub roots: RootSnapshot,
    /// Every record, in id order
    pub objects: Vec<Dna>,
    /// Next id the source would allocate
    pub next_object_id: u64,
}

impl ReplicationSnapshot {
    /// Capture `store`.
    pub fn capture(store: &ObjectStore) -> Self {
        let objects: Vec<Dna> = store.cursor().collect();
        Self {
            roots: store.snapshot_roots(),
            objects,
            next_object_id: store.stats().next_object_id,
        }
    }

    /// Build a fresh store holding exactly this state.
    pub fn restore(&self, config: &ObjectManagerConfig) -> DsoResult<ObjectStore> {
        let store = ObjectStore::new(config);
        for dna in &self.objects {
            store.install_replica(dna)?;
        }
        for (name, id) in &self.roots.roots {
            store.create_or_replace_root(name, *id)?;
        }
        let allocated = store.stats().next_object_id;
        if self.next_object_id > allocated {
            store.allocate_ids(self.next_object_id - allocated);
        }
        Ok(store)
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> DsoResult<String> {
        serde_json::to_string(self).map_err(|e| DsoError::Transport(e.to_string()))
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> DsoResult<Self> {
        serde_json::from_str(json).map_err(|e| DsoError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ApplyMode;
    use dso_common::{ObjectId, Value};

    #[test]
    fn test_capture_and_restore() {
        let config = ObjectManagerConfig::default();
        let store = ObjectStore::new(&config);
        let a = store
            .create_object(&Dna::new_object(ObjectId::new(1), "Node").with_field("next", ObjectId::new(2)))
            .unwrap();
        drop(store.create_object(&Dna::new_object(ObjectId::new(2), "Node").with_field("v", 7i64)).unwrap());
        store
            .apply_delta(&a, &Dna::delta(ObjectId::new(1), "Node").with_field("n", 1i64), 1, ApplyMode::Normal)
            .unwrap();
        drop(a);
        store.create_root("head", ObjectId::new(1)).unwrap();

        let snapshot = ReplicationSnapshot::capture(&store);
        let decoded = ReplicationSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);

        let mirror = decoded.restore(&config).unwrap();
        assert_eq!(mirror.len(), 2);
        assert_eq!(mirror.lookup_root("head"), Some(ObjectId::new(1)));
        assert!(mirror.back_refs().has_edge(ObjectId::new(1), ObjectId::new(2)));
        assert_eq!(mirror.snapshot_of(ObjectId::new(1)).unwrap().version, 2);
        assert_eq!(
            mirror.snapshot_of(ObjectId::new(2)).unwrap().field("v"),
            Some(&Value::Int(7))
        );
        assert_eq!(mirror.outstanding_checkouts(), 0);
        assert_eq!(mirror.next_object_id(), ObjectId::new(3));
    }
}
