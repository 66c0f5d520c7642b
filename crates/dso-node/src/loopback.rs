//! In-process transport: client seams served directly by an object manager

use dso_client::{RemoteObjectManager, ServerMapSource};
use dso_common::{
    ClientId, Dna, DsoError, DsoResult, LockScope, LogicalOp, ObjectId, ObjectIdBatch, Value,
};
use dso_server::ObjectManager;
use std::sync::Arc;

/// Serves one client's requests from an [`ObjectManager`] in the same
/// process.
#[derive(Debug, Clone)]
pub struct LoopbackRemote {
    server: Arc<ObjectManager>,
    client: ClientId,
}

impl LoopbackRemote {
    /// Transport for `client`.
    pub fn new(server: Arc<ObjectManager>, client: ClientId) -> Self {
        Self { server, client }
    }

    /// Client this transport speaks for.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Read-decide-commit against the map's current version, retrying when
    /// another writer got in first. `decide` sees the current value of `key`
    /// and returns the op to commit (if any) plus the caller's result.
    fn mutate_map<R>(
        &self,
        map_id: ObjectId,
        key: &Value,
        scope: &LockScope,
        mut decide: impl FnMut(Option<Value>) -> (Option<LogicalOp>, R),
    ) -> DsoResult<R> {
        loop {
            let (class_name, version, current) = self.server.store().with_record(map_id, |record| {
                (
                    record.class_name().to_string(),
                    record.version(),
                    record.state().map_get(key).cloned(),
                )
            })?;
            let (op, result) = decide(current);
            let Some(op) = op else {
                return Ok(result);
            };

            let delta = Dna::delta(map_id, class_name)
                .with_version(version)
                .with_logical(op);
            match self.server.commit(self.client, &delta, version, scope) {
                Ok(_) => return Ok(result),
                Err(DsoError::StaleVersion { .. }) => {
                    tracing::trace!(target: "dso::node", map = %map_id, "map write raced, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl RemoteObjectManager for LoopbackRemote {
    fn allocate_ids(&self) -> DsoResult<ObjectIdBatch> {
        Ok(self.server.allocate_id_batch())
    }

    fn create_object(&self, client: ClientId, dna: Dna) -> DsoResult<()> {
        self.server.create_object(client, dna).map(|_| ())
    }

    fn fetch_objects(
        &self,
        client: ClientId,
        id: ObjectId,
        parent: Option<ObjectId>,
        max_count: usize,
    ) -> DsoResult<Vec<Dna>> {
        self.server.fetch_objects(client, id, parent, max_count)
    }

    fn commit(&self, client: ClientId, dna: &Dna, version: u64, scope: &LockScope) -> DsoResult<u64> {
        self.server.commit(client, dna, version, scope)
    }

    fn lookup_root(&self, name: &str) -> DsoResult<Option<ObjectId>> {
        Ok(self.server.lookup_root(name))
    }

    fn create_or_replace_root(&self, name: &str, id: ObjectId) -> DsoResult<()> {
        self.server.create_or_replace_root(name, id).map(|_| ())
    }

    fn release_references(&self, client: ClientId, ids: &[ObjectId]) -> DsoResult<()> {
        self.server.release_client_references(client, ids.iter().copied());
        Ok(())
    }
}

impl ServerMapSource for LoopbackRemote {
    fn get(&self, map_id: ObjectId, key: &Value) -> DsoResult<Option<Value>> {
        self.server.map_get(self.client, map_id, key)
    }

    fn put(&self, map_id: ObjectId, key: Value, value: Value, scope: &LockScope) -> DsoResult<Option<Value>> {
        self.mutate_map(map_id, &key, scope, |current| {
            let op = LogicalOp::MapPut {
                key: key.clone(),
                value: value.clone(),
            };
            (Some(op), current)
        })
    }

    fn remove(&self, map_id: ObjectId, key: &Value, scope: &LockScope) -> DsoResult<Option<Value>> {
        self.mutate_map(map_id, key, scope, |current| {
            let op = current
                .is_some()
                .then(|| LogicalOp::MapRemove { key: key.clone() });
            (op, current)
        })
    }

    fn put_if_absent(
        &self,
        map_id: ObjectId,
        key: Value,
        value: Value,
        scope: &LockScope,
    ) -> DsoResult<Option<Value>> {
        self.mutate_map(map_id, &key, scope, |current| match current {
            Some(existing) => (None, Some(existing)),
            None => {
                let op = LogicalOp::MapPut {
                    key: key.clone(),
                    value: value.clone(),
                };
                (Some(op), None)
            }
        })
    }

    fn replace(&self, map_id: ObjectId, key: Value, value: Value, scope: &LockScope) -> DsoResult<Option<Value>> {
        self.mutate_map(map_id, &key, scope, |current| match current {
            Some(previous) => {
                let op = LogicalOp::MapPut {
                    key: key.clone(),
                    value: value.clone(),
                };
                (Some(op), Some(previous))
            }
            None => (None, None),
        })
    }

    fn clear(&self, map_id: ObjectId, scope: &LockScope) -> DsoResult<()> {
        // Clearing does not depend on the contents; any key works
        self.mutate_map(map_id, &Value::Null, scope, |_| (Some(LogicalOp::MapClear), ()))
    }

    fn size(&self, map_id: ObjectId) -> DsoResult<usize> {
        self.server.map_size(map_id)
    }
}
