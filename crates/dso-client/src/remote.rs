//! Seams between the client and the object manager it talks to
//!
//! A networked deployment implements these over its transport; the node
//! crate implements them in-process.

use dso_common::{ClientId, Dna, DsoResult, LockScope, ObjectId, ObjectIdBatch, Value};

/// Server-side object manager operations a client needs.
pub trait RemoteObjectManager: Send + Sync {
    /// Reserve a fresh range of object ids.
    fn allocate_ids(&self) -> DsoResult<ObjectIdBatch>;

    /// Create an object from its initial state. The creating client holds it.
    fn create_object(&self, client: ClientId, dna: Dna) -> DsoResult<()>;

    /// Fault `id` in, followed by prefetched neighbours (at most `max_count`
    /// records in total). `parent` is only a prefetch hint.
    fn fetch_objects(
        &self,
        client: ClientId,
        id: ObjectId,
        parent: Option<ObjectId>,
        max_count: usize,
    ) -> DsoResult<Vec<Dna>>;

    /// Ship a delta produced against `version`. Returns the new version.
    fn commit(&self, client: ClientId, dna: &Dna, version: u64, scope: &LockScope)
    -> DsoResult<u64>;

    /// Resolve a named root.
    fn lookup_root(&self, name: &str) -> DsoResult<Option<ObjectId>>;

    /// Bind a named root, replacing any previous binding.
    fn create_or_replace_root(&self, name: &str, id: ObjectId) -> DsoResult<()>;

    /// This client no longer holds `ids`.
    fn release_references(&self, client: ClientId, ids: &[ObjectId]) -> DsoResult<()>;
}

/// Authoritative contents of server-backed maps.
///
/// Mutations are logical operations applied by the server; a successful
/// return means the server has committed them.
pub trait ServerMapSource: Send + Sync {
    /// Current value for `key`.
    fn get(&self, map_id: ObjectId, key: &Value) -> DsoResult<Option<Value>>;

    /// Associate `key` with `value`, returning the previous value.
    fn put(&self, map_id: ObjectId, key: Value, value: Value, scope: &LockScope)
    -> DsoResult<Option<Value>>;

    /// Remove `key`, returning the previous value.
    fn remove(&self, map_id: ObjectId, key: &Value, scope: &LockScope) -> DsoResult<Option<Value>>;

    /// Insert only if `key` is absent. Returns the value already present, if any.
    fn put_if_absent(
        &self,
        map_id: ObjectId,
        key: Value,
        value: Value,
        scope: &LockScope,
    ) -> DsoResult<Option<Value>>;

    /// Replace only if `key` is present. Returns the previous value, if any.
    fn replace(
        &self,
        map_id: ObjectId,
        key: Value,
        value: Value,
        scope: &LockScope,
    ) -> DsoResult<Option<Value>>;

    /// Remove every entry.
    fn clear(&self, map_id: ObjectId, scope: &LockScope) -> DsoResult<()>;

    /// Authoritative entry count.
    fn size(&self, map_id: ObjectId) -> DsoResult<usize>;
}
