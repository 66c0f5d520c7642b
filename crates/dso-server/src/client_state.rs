//! Per-client held object ids
//!
//! Every id a client has been sent or has created stays here until that
//! client reports it released or disconnects. The union over all clients is
//! the DGC rescue set.

use dso_common::{ClientId, ObjectId, ObjectIdSet};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Tracks which ids each connected client holds.
#[derive(Debug, Default)]
pub struct ClientStateManager {
    clients: RwLock<FxHashMap<ClientId, ObjectIdSet>>,
}

impl ClientStateManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client with no references.
    pub fn add_client(&self, client: ClientId) {
        self.clients.write().entry(client).or_default();
    }

    /// Record ids now held by `client`.
    pub fn add_references(&self, client: ClientId, ids: impl IntoIterator<Item = ObjectId>) {
        self.clients.write().entry(client).or_default().extend(ids);
    }

    /// Forget ids `client` has released. Returns how many were held.
    pub fn remove_references(
        &self,
        client: ClientId,
        ids: impl IntoIterator<Item = ObjectId>,
    ) -> usize {
        let mut clients = self.clients.write();
        let Some(held) = clients.get_mut(&client) else {
            return 0;
        };
        ids.into_iter().filter(|id| held.remove(*id)).count()
    }

    /// Drop every reference of a disconnected client.
    pub fn remove_client(&self, client: ClientId) -> Option<ObjectIdSet> {
        self.clients.write().remove(&client)
    }

    /// Drop collected ids from every client.
    pub fn remove_collected(&self, collected: &ObjectIdSet) {
        for held in self.clients.write().values_mut() {
            held.subtract(collected);
        }
    }

    /// Add every held id to `out`.
    pub fn add_all_referenced_ids_to(&self, out: &mut ObjectIdSet) {
        for held in self.clients.read().values() {
            out.union_with(held);
        }
    }

    /// Whether any client holds `id`.
    pub fn is_referenced(&self, id: ObjectId) -> bool {
        self.clients.read().values().any(|held| held.contains(id))
    }

    /// Whether `client` holds `id`.
    pub fn has_reference(&self, client: ClientId, id: ObjectId) -> bool {
        self.clients
            .read()
            .get(&client)
            .is_some_and(|held| held.contains(id))
    }

    /// Connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Sum of per-client held counts.
    pub fn reference_count(&self) -> usize {
        self.clients.read().values().map(ObjectIdSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_per_client() {
        let state = ClientStateManager::new();
        let a = ClientId(1);
        let b = ClientId(2);
        state.add_references(a, [ObjectId::new(1), ObjectId::new(2)]);
        state.add_references(b, [ObjectId::new(2)]);

        assert!(state.is_referenced(ObjectId::new(1)));
        assert_eq!(state.remove_references(a, [ObjectId::new(1), ObjectId::new(9)]), 1);
        assert!(!state.is_referenced(ObjectId::new(1)));

        let mut all = ObjectIdSet::new();
        state.add_all_referenced_ids_to(&mut all);
        assert_eq!(all.len(), 1);

        state.remove_client(b);
        assert!(state.has_reference(a, ObjectId::new(2)));
        assert_eq!(state.client_count(), 1);
    }

    #[test]
    fn test_remove_collected() {
        let state = ClientStateManager::new();
        state.add_references(ClientId(1), [ObjectId::new(3), ObjectId::new(4)]);
        state.remove_collected(&[ObjectId::new(3)].into_iter().collect());
        assert_eq!(state.reference_count(), 1);
    }
}
