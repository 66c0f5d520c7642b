//! Object manager facade tests: fault-in, commits, maps, roots, dumps

use dso_common::{ClientId, Dna, DsoError, LockScope, LogicalOp, ObjectId, Value};
use dso_server::{MapChange, MapChangeListener, ObjectManager, ObjectManagerConfig};
use parking_lot::Mutex;
use std::sync::Arc;

fn manager() -> Arc<ObjectManager> {
    let om = ObjectManager::new(ObjectManagerConfig::default().without_periodic_gc());
    om.start().unwrap();
    om
}

fn id(raw: u64) -> ObjectId {
    ObjectId::new(raw)
}

fn scope() -> LockScope {
    LockScope::new("lock")
}

const WRITER: ClientId = ClientId(1);
const READER: ClientId = ClientId(2);

fn chain(om: &ObjectManager, len: u64) {
    for raw in 1..=len {
        let mut dna = Dna::new_object(id(raw), "Node").with_field("n", raw as i64);
        if raw < len {
            dna = dna.with_field("next", id(raw + 1));
        }
        om.create_object(WRITER, dna).unwrap();
    }
}

#[test]
fn test_fetch_prefetches_breadth_first_up_to_limit() {
    let om = manager();
    chain(&om, 5);

    let objects = om.fetch_objects(READER, id(1), None, 3).unwrap();
    let ids: Vec<u64> = objects.iter().map(|dna| dna.id.to_u64()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(objects[0].field("n"), Some(&Value::Int(1)));
    for raw in 1..=3 {
        assert!(om.client_state().has_reference(READER, id(raw)));
    }

    // Already-held neighbours are not resent
    let objects = om.fetch_objects(READER, id(2), None, 3).unwrap();
    let ids: Vec<u64> = objects.iter().map(|dna| dna.id.to_u64()).collect();
    assert_eq!(ids, vec![2, 4, 5]);
}

#[test]
fn test_fetch_uses_parent_hint() {
    let om = manager();
    om.create_object(WRITER, Dna::new_object(id(2), "Leaf")).unwrap();
    om.create_object(WRITER, Dna::new_object(id(3), "Leaf")).unwrap();
    om.create_object(
        WRITER,
        Dna::new_object(id(1), "Pair").with_field("a", id(2)).with_field("b", id(3)),
    )
    .unwrap();

    let objects = om.fetch_objects(READER, id(2), Some(id(1)), 10).unwrap();
    let ids: Vec<u64> = objects.iter().map(|dna| dna.id.to_u64()).collect();
    assert_eq!(ids, vec![2, 3]);
}

#[test]
fn test_fetch_default_depth_and_dangling_refs() {
    let om = manager();
    om.create_object(WRITER, Dna::new_object(id(1), "Node").with_field("ghost", id(77)))
        .unwrap();
    let objects = om.fetch_objects(READER, id(1), None, 0).unwrap();
    assert_eq!(objects.len(), 1);
}

#[test]
fn test_commit_versions_and_stale_rejection() {
    let om = manager();
    om.create_object(WRITER, Dna::new_object(id(1), "Counter").with_field("n", 0i64))
        .unwrap();

    let v = om
        .commit(WRITER, &Dna::delta(id(1), "Counter").with_field("n", 1i64), 1, &scope())
        .unwrap();
    assert_eq!(v, 2);

    let err = om
        .commit(READER, &Dna::delta(id(1), "Counter").with_field("n", 5i64), 1, &scope())
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, DsoError::StaleVersion { current: 2, .. }));

    let v = om
        .commit_forced(READER, &Dna::delta(id(1), "Counter").with_field("n", 5i64), &scope())
        .unwrap();
    assert_eq!(v, 3);
    assert_eq!(
        om.store().snapshot_of(id(1)).unwrap().field("n"),
        Some(&Value::Int(5))
    );
}

#[test]
fn test_commit_new_object_dna_creates() {
    let om = manager();
    let version = om
        .commit(WRITER, &Dna::new_object(id(4), "Node"), 0, &scope())
        .unwrap();
    assert_eq!(version, 1);
    assert!(om.store().contains(id(4)));
}

#[test]
fn test_commit_to_unknown_object() {
    let om = manager();
    let err = om
        .commit(WRITER, &Dna::delta(id(3), "Node").with_field("x", 1i64), 0, &scope())
        .unwrap_err();
    assert!(err.is_terminal());
}

struct Recorder(Mutex<Vec<(ClientId, ObjectId, MapChange)>>);

impl MapChangeListener for Recorder {
    fn map_changed(&self, origin: ClientId, map_id: ObjectId, change: &MapChange) {
        self.0.lock().push((origin, map_id, change.clone()));
    }
}

#[test]
fn test_map_reads_and_change_notifications() {
    let om = manager();
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    om.add_map_listener(recorder.clone());

    om.create_object(WRITER, Dna::new_object(id(10), "Value")).unwrap();
    om.create_object(WRITER, Dna::new_object(id(1), "ConcurrentHashMap"))
        .unwrap();
    om.commit(
        WRITER,
        &Dna::delta(id(1), "ConcurrentHashMap")
            .with_logical(LogicalOp::MapPut { key: Value::from("a"), value: Value::Int(1) })
            .with_logical(LogicalOp::MapPut { key: Value::from("b"), value: Value::Ref(id(10)) }),
        1,
        &scope(),
    )
    .unwrap();

    assert_eq!(om.map_size(id(1)).unwrap(), 2);
    assert_eq!(om.map_keys(id(1)).unwrap(), vec![Value::from("a"), Value::from("b")]);
    assert_eq!(om.map_get(READER, id(1), &Value::from("a")).unwrap(), Some(Value::Int(1)));
    assert_eq!(
        om.map_get(READER, id(1), &Value::from("b")).unwrap(),
        Some(Value::Ref(id(10)))
    );
    // Handing out a reference makes the reader hold it
    assert!(om.client_state().has_reference(READER, id(10)));

    om.commit(
        WRITER,
        &Dna::delta(id(1), "ConcurrentHashMap").with_logical(LogicalOp::MapClear),
        2,
        &scope(),
    )
    .unwrap();
    assert_eq!(om.map_size(id(1)).unwrap(), 0);

    let events = recorder.0.lock();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        (WRITER, id(1), MapChange::Keys(vec![Value::from("a"), Value::from("b")]))
    );
    assert_eq!(events[1].2, MapChange::Cleared);
}

#[test]
fn test_client_disconnect_releases_everything() {
    let om = manager();
    chain(&om, 3);
    om.client_connected(READER);
    om.fetch_objects(READER, id(1), None, 10).unwrap();
    om.release_client_references(WRITER, [id(1), id(2), id(3)]);

    assert!(om.gc().unwrap().collected.is_empty());
    om.client_disconnected(READER);
    assert_eq!(om.gc().unwrap().collected.len(), 3);
}

#[test]
fn test_dump_reports_checkouts_and_gc() {
    let om = manager();
    chain(&om, 2);
    om.create_root("head", id(1)).unwrap();
    let handle = om.store().checkout(id(2)).unwrap();

    let stats = om.dump();
    assert_eq!(stats.store.objects, 2);
    assert_eq!(stats.store.outstanding_checkouts, 1);
    assert_eq!(stats.store.roots, 1);
    assert_eq!(stats.clients, 1);
    drop(handle);

    om.gc().unwrap();
    let stats = om.dump();
    assert_eq!(stats.gc_iterations, 1);
    assert!(stats.last_gc.is_some());
    let json = stats.to_json().unwrap();
    assert!(json.contains("\"outstanding_checkouts\": 0"));
}

#[test]
fn test_replication_snapshot_round_trip() {
    let om = manager();
    chain(&om, 3);
    om.create_root("head", id(1)).unwrap();

    let snapshot = om.replication_snapshot();
    assert_eq!(om.records_cursor().count(), 3);
    assert_eq!(om.snapshot_roots().roots, vec![("head".to_string(), id(1))]);

    let mirror = snapshot.restore(om.config()).unwrap();
    let mirror = ObjectManager::with_store(om.config().clone(), Arc::new(mirror));
    mirror.start().unwrap();
    assert_eq!(mirror.lookup_root("head"), Some(id(1)));
    assert_eq!(mirror.root_names(), vec!["head"]);
    assert!(mirror.gc().unwrap().collected.is_empty());
}

#[test]
fn test_id_allocation() {
    let om = manager();
    let mut batch = om.allocate_id_batch();
    assert_eq!(batch.remaining(), 1000);
    let first = batch.next_id().unwrap();
    let other = om.allocate_ids(5);
    assert_eq!(other.remaining(), 5);
    assert!(first.to_u64() >= 1);
}
