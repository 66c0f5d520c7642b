//! Named roots

use dso_common::ObjectId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root name -> object id.
#[derive(Debug, Default)]
pub struct RootTable {
    roots: RwLock<BTreeMap<String, ObjectId>>,
}

/// Point-in-time copy of the root table, in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSnapshot {
    /// (name, id) pairs
    pub roots: Vec<(String, ObjectId)>,
}

impl RootTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` unless it is already bound. Returns the id the name
    /// resolves to afterwards.
    pub fn create_root(&self, name: &str, id: ObjectId) -> ObjectId {
        *self.roots.write().entry(name.to_string()).or_insert(id)
    }

    /// Bind `name`, replacing any previous binding. Returns the old id.
    pub fn create_or_replace_root(&self, name: &str, id: ObjectId) -> Option<ObjectId> {
        self.roots.write().insert(name.to_string(), id)
    }

    /// Resolve a root.
    pub fn lookup_root(&self, name: &str) -> Option<ObjectId> {
        self.roots.read().get(name).copied()
    }

    /// All root names, sorted.
    pub fn root_names(&self) -> Vec<String> {
        self.roots.read().keys().cloned().collect()
    }

    /// Distinct root ids.
    pub fn root_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.roots.read().values().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Whether some root points at `id`.
    pub fn is_root(&self, id: ObjectId) -> bool {
        self.roots.read().values().any(|root| *root == id)
    }

    /// Number of roots.
    pub fn len(&self) -> usize {
        self.roots.read().len()
    }

    /// Whether no root is bound.
    pub fn is_empty(&self) -> bool {
        self.roots.read().is_empty()
    }

    /// Copy the table.
    pub fn snapshot(&self) -> RootSnapshot {
        RootSnapshot {
            roots: self
                .roots
                .read()
                .iter()
                .map(|(name, id)| (name.clone(), *id))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_root_keeps_first_binding() {
        let roots = RootTable::new();
        assert_eq!(roots.create_root("app", ObjectId::new(1)), ObjectId::new(1));
        assert_eq!(roots.create_root("app", ObjectId::new(2)), ObjectId::new(1));
        assert_eq!(roots.lookup_root("app"), Some(ObjectId::new(1)));
    }

    #[test]
    fn test_replace_root() {
        let roots = RootTable::new();
        roots.create_root("app", ObjectId::new(1));
        assert_eq!(
            roots.create_or_replace_root("app", ObjectId::new(2)),
            Some(ObjectId::new(1))
        );
        assert_eq!(roots.lookup_root("app"), Some(ObjectId::new(2)));
        assert!(!roots.is_root(ObjectId::new(1)));
    }

    #[test]
    fn test_snapshot_is_name_ordered() {
        let roots = RootTable::new();
        roots.create_root("b", ObjectId::new(2));
        roots.create_root("a", ObjectId::new(1));
        roots.create_root("c", ObjectId::new(1));
        let snapshot = roots.snapshot();
        assert_eq!(snapshot.roots[0].0, "a");
        assert_eq!(roots.root_ids(), vec![ObjectId::new(1), ObjectId::new(2)]);
        assert_eq!(roots.root_names(), vec!["a", "b", "c"]);
    }
}
