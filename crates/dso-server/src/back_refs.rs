//! Back-reference index
//!
//! Reverse edges of the committed object graph: child -> set of parents
//! holding at least one reference to it. Only delta application and the
//! DGC sweep mutate it.

use dashmap::DashMap;
use dso_common::ObjectId;
use rustc_hash::{FxBuildHasher, FxHashSet};

/// Child-to-parents edge index.
#[derive(Debug, Default)]
pub struct BackReferenceIndex {
    parents: DashMap<ObjectId, FxHashSet<ObjectId>, FxBuildHasher>,
}

impl BackReferenceIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `parent` references `child`.
    pub fn add_edge(&self, parent: ObjectId, child: ObjectId) {
        self.parents.entry(child).or_default().insert(parent);
    }

    /// Drop the `parent -> child` edge. Children left with no parents lose
    /// their entry.
    pub fn remove_edge(&self, parent: ObjectId, child: ObjectId) {
        if let Some(mut set) = self.parents.get_mut(&child) {
            set.remove(&parent);
        }
        self.parents.remove_if(&child, |_, set| set.is_empty());
    }

    /// Parents of `child`, empty if none.
    pub fn parents_of(&self, child: ObjectId) -> FxHashSet<ObjectId> {
        self.parents
            .get(&child)
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// Whether any object references `child`.
    pub fn has_parents(&self, child: ObjectId) -> bool {
        self.parents.get(&child).is_some_and(|set| !set.is_empty())
    }

    /// Whether `parent -> child` is recorded.
    pub fn has_edge(&self, parent: ObjectId, child: ObjectId) -> bool {
        self.parents
            .get(&child)
            .is_some_and(|set| set.contains(&parent))
    }

    /// Remove `id` as a target and as a source of the given forward edges.
    pub fn remove_object(&self, id: ObjectId, children: impl IntoIterator<Item = ObjectId>) {
        self.parents.remove(&id);
        for child in children {
            self.remove_edge(id, child);
        }
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.parents.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of children with at least one parent.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    /// Whether no edge is recorded.
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u64) -> ObjectId {
        ObjectId::new(raw)
    }

    #[test]
    fn test_add_and_remove_edges() {
        let index = BackReferenceIndex::new();
        index.add_edge(id(1), id(2));
        index.add_edge(id(3), id(2));
        assert_eq!(index.edge_count(), 2);
        assert!(index.has_edge(id(1), id(2)));

        index.remove_edge(id(1), id(2));
        assert!(!index.has_edge(id(1), id(2)));
        assert!(index.has_parents(id(2)));

        index.remove_edge(id(3), id(2));
        assert!(!index.has_parents(id(2)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_object_drops_both_directions() {
        let index = BackReferenceIndex::new();
        index.add_edge(id(1), id(2));
        index.add_edge(id(2), id(1));
        index.add_edge(id(2), id(3));

        index.remove_object(id(2), [id(1), id(3)]);
        assert!(!index.has_parents(id(1)));
        assert!(!index.has_parents(id(2)));
        assert!(!index.has_parents(id(3)));
        assert_eq!(index.edge_count(), 0);
    }

    #[test]
    fn test_self_edge() {
        let index = BackReferenceIndex::new();
        index.add_edge(id(4), id(4));
        assert_eq!(index.parents_of(id(4)).len(), 1);
        index.remove_object(id(4), [id(4)]);
        assert!(index.is_empty());
    }
}
