//! Client object manager tests against an in-memory object server

use dso_client::{ClassRegistry, ClientConfig, ClientObjectManager, Reference, RemoteObjectManager, SharedObject};
use dso_common::{
    ClientId, Dna, DnaAction, DnaWriter, DsoError, DsoResult, LockScope, LogicalOp, ObjectId,
    ObjectIdBatch, ObjectIdSet, Value,
};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Keeps full-state records and applies physical deltas with version checks.
#[derive(Default)]
struct FakeServer {
    records: Mutex<BTreeMap<ObjectId, Dna>>,
    roots: Mutex<BTreeMap<String, ObjectId>>,
    next_id: Mutex<u64>,
    released: Mutex<Vec<ObjectId>>,
    /// Ids the client currently holds: everything sent minus everything released
    held: Mutex<BTreeSet<ObjectId>>,
    /// Parks the next release: signals the first channel, waits on the second
    release_gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
    commits: Mutex<Vec<Dna>>,
    fetches: AtomicUsize,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        let server = Self::default();
        *server.next_id.lock() = 1;
        Arc::new(server)
    }

    fn seed(&self, dna: Dna) {
        self.records.lock().insert(dna.id, dna.with_version(1));
    }

    fn field(&self, id: ObjectId, name: &str) -> Option<Value> {
        self.records.lock().get(&id).and_then(|dna| dna.field(name).cloned())
    }
}

impl RemoteObjectManager for FakeServer {
    fn allocate_ids(&self) -> DsoResult<ObjectIdBatch> {
        let mut next = self.next_id.lock();
        let batch = ObjectIdBatch::new(*next, *next + 10);
        *next += 10;
        Ok(batch)
    }

    fn create_object(&self, _client: ClientId, dna: Dna) -> DsoResult<()> {
        self.seed(dna);
        Ok(())
    }

    fn fetch_objects(
        &self,
        _client: ClientId,
        id: ObjectId,
        _parent: Option<ObjectId>,
        max_count: usize,
    ) -> DsoResult<Vec<Dna>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let records = self.records.lock();
        if !records.contains_key(&id) {
            return Err(DsoError::NotFound(id));
        }
        let mut out = Vec::new();
        let mut queue = VecDeque::from([id]);
        let mut seen = std::collections::BTreeSet::new();
        while let Some(next) = queue.pop_front() {
            if out.len() >= max_count.max(1) || !seen.insert(next) {
                continue;
            }
            if let Some(dna) = records.get(&next) {
                let mut refs: Vec<ObjectId> = dna.references().into_iter().collect();
                refs.sort();
                queue.extend(refs);
                out.push(dna.clone());
            }
        }
        self.held.lock().extend(out.iter().map(|dna| dna.id));
        Ok(out)
    }

    fn commit(&self, _client: ClientId, dna: &Dna, version: u64, _scope: &LockScope) -> DsoResult<u64> {
        let mut records = self.records.lock();
        let record = records.get_mut(&dna.id).ok_or(DsoError::NotFound(dna.id))?;
        if version < record.version {
            return Err(DsoError::StaleVersion {
                id: dna.id,
                current: record.version,
                attempted: version,
            });
        }
        for action in &dna.actions {
            match action {
                DnaAction::Physical { field, .. } => {
                    record.actions.retain(|existing| {
                        !matches!(existing, DnaAction::Physical { field: f, .. } if f == field)
                    });
                    record.actions.push(action.clone());
                }
                DnaAction::Logical(_) => record.actions.push(action.clone()),
            }
        }
        record.version = record.version.max(version) + 1;
        self.commits.lock().push(dna.clone());
        Ok(record.version)
    }

    fn lookup_root(&self, name: &str) -> DsoResult<Option<ObjectId>> {
        Ok(self.roots.lock().get(name).copied())
    }

    fn create_or_replace_root(&self, name: &str, id: ObjectId) -> DsoResult<()> {
        self.roots.lock().insert(name.to_string(), id);
        Ok(())
    }

    fn release_references(&self, _client: ClientId, ids: &[ObjectId]) -> DsoResult<()> {
        let gate = self.release_gate.lock().take();
        if let Some((entered, proceed)) = gate {
            entered.send(()).unwrap();
            proceed.recv().unwrap();
        }
        self.released.lock().extend_from_slice(ids);
        let mut held = self.held.lock();
        for id in ids {
            held.remove(id);
        }
        Ok(())
    }
}

#[derive(Default)]
struct Node {
    name: String,
    next: Reference,
}

impl SharedObject for Node {
    fn class_name(&self) -> &str {
        "Node"
    }

    fn dehydrate(&self, writer: &mut DnaWriter) {
        writer.field("name", self.name.as_str()).field("next", self.next.to_value());
    }

    fn hydrate(&mut self, dna: &Dna) -> DsoResult<()> {
        self.name = dna.field("name").and_then(Value::as_str).unwrap_or_default().to_string();
        self.next = dna.field("next").map(Reference::from_value).unwrap_or_default();
        Ok(())
    }

    fn visit_references(&mut self, visitor: &mut dyn FnMut(&mut Reference)) {
        visitor(&mut self.next);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
struct Tally {
    items: Vec<Value>,
}

impl SharedObject for Tally {
    fn class_name(&self) -> &str {
        "Tally"
    }

    fn dehydrate(&self, writer: &mut DnaWriter) {
        for item in &self.items {
            writer.logical(LogicalOp::ListAdd(item.clone()));
        }
    }

    fn hydrate(&mut self, dna: &Dna) -> DsoResult<()> {
        self.items.clear();
        for op in dna.logical_ops() {
            self.apply_logical(op)?;
        }
        Ok(())
    }

    fn apply_logical(&mut self, op: &LogicalOp) -> DsoResult<()> {
        match op {
            LogicalOp::ListAdd(value) => self.items.push(value.clone()),
            LogicalOp::ListClear => self.items.clear(),
            other => return Err(DsoError::invalid_dna(ObjectId::new(0), format!("{other:?}"))),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn classes() -> ClassRegistry {
    let mut registry = ClassRegistry::new();
    registry.register_default::<Node>("Node").register_default::<Tally>("Tally");
    registry
}

fn client(server: &Arc<FakeServer>, raw: u64) -> Arc<ClientObjectManager> {
    client_with(server, raw, ClientConfig::default())
}

fn client_with(server: &Arc<FakeServer>, raw: u64, config: ClientConfig) -> Arc<ClientObjectManager> {
    ClientObjectManager::new(ClientId(raw), config, server.clone(), classes())
}

fn id(raw: u64) -> ObjectId {
    ObjectId::new(raw)
}

fn node(name: &str, next: Option<u64>) -> Node {
    Node {
        name: name.to_string(),
        next: next.map(|raw| Reference::new(id(raw))).unwrap_or_default(),
    }
}

/// Seed `first..=last` as a chain on the server.
fn seed_chain(server: &FakeServer, first: u64, last: u64) {
    for raw in first..=last {
        let mut dna = Dna::new_object(id(raw), "Node").with_field("name", format!("n{raw}"));
        if raw < last {
            dna = dna.with_field("next", id(raw + 1));
        }
        server.seed(dna);
    }
}

fn name_of(peer: &dso_client::Peer) -> String {
    peer.read(|n: &Node| n.name.clone()).unwrap()
}

#[test]
fn test_lookup_returns_the_same_instance() {
    let server = FakeServer::new();
    seed_chain(&server, 100, 100);
    let manager = client(&server, 1);

    let a = manager.lookup_object(id(100)).unwrap();
    let b = manager.lookup_object(id(100)).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(name_of(&a), "n100");
    assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
    assert!(manager.lookup_if_local(id(100)).is_some());
}

#[test]
fn test_concurrent_lookups_share_one_fault() {
    let server = FakeServer::new();
    seed_chain(&server, 100, 100);
    let manager = client(&server, 1);

    let peers: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.lookup_object(id(100)).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    for peer in &peers[1..] {
        assert!(Arc::ptr_eq(&peers[0], peer));
    }
    assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lookup_or_create_is_idempotent() {
    let server = FakeServer::new();
    let manager = client(&server, 1);

    let peer = manager.new_peer(node("fresh", None));
    assert_eq!(peer.id(), None);
    let first = manager.lookup_or_create(&peer).unwrap();
    let second = manager.lookup_or_create(&peer).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(peer.id(), Some(first.id()));
    assert_eq!(server.records.lock().len(), 1);
    assert_eq!(server.field(first.id(), "name"), Some(Value::from("fresh")));
}

#[test]
fn test_shared_state_reaches_another_process() {
    let server = FakeServer::new();
    let writer = client(&server, 1);
    let reader = client(&server, 2);

    let tail = writer.share(node("tail", None)).unwrap();
    let head = writer
        .share(Node {
            name: "head".to_string(),
            next: writer.reference_to(&tail).unwrap(),
        })
        .unwrap();
    writer.create_or_replace_root("list", &head).unwrap();

    let seen = reader.lookup_root("list").unwrap().unwrap();
    assert_eq!(name_of(&seen), "head");
    let next = seen.read(|n: &Node| n.next.get().cloned()).unwrap().unwrap();
    assert_eq!(name_of(&next), "tail");
    assert!(reader.lookup_root("missing").unwrap().is_none());
}

#[test]
fn test_commit_ships_only_changed_fields() {
    let server = FakeServer::new();
    let manager = client(&server, 1);
    let peer = manager.share(node("a", None)).unwrap();
    let scope = LockScope::new("l");

    assert_eq!(manager.commit(&peer, &scope).unwrap(), 1);
    assert!(server.commits.lock().is_empty());

    peer.write(|n: &mut Node| n.name = "b".to_string()).unwrap();
    assert_eq!(manager.commit(&peer, &scope).unwrap(), 2);
    let commits = server.commits.lock().clone();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].actions.len(), 1);
    assert_eq!(commits[0].field("name"), Some(&Value::from("b")));

    manager.commit(&peer, &scope).unwrap();
    assert_eq!(server.commits.lock().len(), 1);
}

#[test]
fn test_stale_commit_recovers_after_refresh() {
    let server = FakeServer::new();
    seed_chain(&server, 100, 100);
    let a = client(&server, 1);
    let b = client(&server, 2);
    let scope = LockScope::new("l");

    let on_a = a.lookup_object(id(100)).unwrap();
    let on_b = b.lookup_object(id(100)).unwrap();

    on_a.write(|n: &mut Node| n.name = "from-a".to_string()).unwrap();
    a.commit(&on_a, &scope).unwrap();

    on_b.write(|n: &mut Node| n.name = "from-b".to_string()).unwrap();
    let err = b.commit(&on_b, &scope).unwrap_err();
    assert!(err.is_retryable());

    b.refresh(&on_b).unwrap();
    assert_eq!(name_of(&on_b), "from-a");
    on_b.write(|n: &mut Node| n.name = "from-b".to_string()).unwrap();
    b.commit(&on_b, &scope).unwrap();
    assert_eq!(server.field(id(100), "name"), Some(Value::from("from-b")));
}

#[test]
fn test_depth_limited_and_full_faulting() {
    let server = FakeServer::new();
    seed_chain(&server, 100, 103);
    let manager = client(&server, 1);

    let head = manager.lookup_object(id(100)).unwrap();
    let second = head.read(|n: &Node| n.next.get().cloned()).unwrap().unwrap();
    assert_eq!(second.id(), Some(id(101)));
    assert!(!second.read(|n: &Node| n.next.is_resolved()).unwrap());
    // Neighbours came with the first round trip
    assert_eq!(server.fetches.load(Ordering::SeqCst), 1);

    let mut next = second.read(|n: &Node| n.next.clone()).unwrap();
    let third = manager.resolve(&mut next).unwrap();
    assert_eq!(name_of(&third), "n102");

    let other = client(&server, 2);
    let head = other.lookup_object_no_depth(id(100)).unwrap();
    let mut names = Vec::new();
    let mut cursor = Some(head);
    while let Some(peer) = cursor {
        names.push(name_of(&peer));
        cursor = peer.read(|n: &Node| n.next.get().cloned()).unwrap();
    }
    assert_eq!(names, vec!["n100", "n101", "n102", "n103"]);
}

#[test]
fn test_dropped_peers_are_cleaned_up_and_released() {
    let server = FakeServer::new();
    let manager = client(&server, 1);

    let peer = manager.share(node("temp", None)).unwrap();
    let oid = peer.id().unwrap();
    assert_eq!(manager.run_cleanup(), 0);

    drop(peer);
    assert_eq!(manager.run_cleanup(), 1);
    assert!(manager.lookup_if_local(oid).is_none());
    assert_eq!(server.released.lock().clone(), vec![oid]);
    assert_eq!(manager.dump().cleaned, 1);
}

#[test]
fn test_clearing_references_breaks_local_cycles() {
    let server = FakeServer::new();
    server.seed(Dna::new_object(id(100), "Node").with_field("name", "a").with_field("next", id(101)));
    server.seed(Dna::new_object(id(101), "Node").with_field("name", "b").with_field("next", id(100)));
    let manager = client(&server, 1);

    let a = manager.lookup_object_no_depth(id(100)).unwrap();
    drop(a);
    // a <-> b keep each other alive
    assert_eq!(manager.run_cleanup(), 0);
    assert_eq!(manager.dump().live_peers, 2);

    assert_eq!(manager.clear_references(usize::MAX), 2);
    assert_eq!(manager.run_cleanup(), 2);
    assert_eq!(manager.dump().proxies, 0);
}

#[test]
fn test_collected_ids_become_tombstoned() {
    let server = FakeServer::new();
    seed_chain(&server, 100, 100);
    let manager = client(&server, 1);
    let peer = manager.lookup_object(id(100)).unwrap();

    let collected: ObjectIdSet = [id(100)].into_iter().collect();
    assert_eq!(manager.handle_objects_collected(&collected), 1);
    assert!(manager.is_tombstoned(id(100)));
    assert_eq!(manager.lookup_object(id(100)).unwrap_err(), DsoError::Tombstoned(id(100)));
    assert_eq!(
        manager.lookup_or_create(&peer).unwrap_err(),
        DsoError::Tombstoned(id(100))
    );
}

#[test]
fn test_lookup_failures_are_distinct() {
    let server = FakeServer::new();
    server.seed(Dna::new_object(id(100), "Unknown"));
    let manager = client(&server, 1);

    let err = manager.lookup_object(id(100)).unwrap_err();
    assert_eq!(err, DsoError::ClassNotFound("Unknown".to_string()));
    assert!(err.is_terminal());

    let err = manager.lookup_object(id(555)).unwrap_err();
    assert_eq!(err, DsoError::NotFound(id(555)));
}

#[test]
fn test_logical_ops_ship_then_apply() {
    let server = FakeServer::new();
    let manager = client(&server, 1);
    let tally = manager.share(Tally::default()).unwrap();

    manager
        .invoke_logical(&tally, LogicalOp::ListAdd(Value::Int(3)), &LockScope::new("l"))
        .unwrap();
    assert_eq!(tally.read(|t: &Tally| t.items.clone()).unwrap(), vec![Value::Int(3)]);

    let other = client(&server, 2);
    let seen = other.lookup_object(tally.id().unwrap()).unwrap();
    assert_eq!(seen.read(|t: &Tally| t.items.len()).unwrap(), 1);
}

#[test]
fn test_rejected_logical_op_reloads_from_server() {
    let server = FakeServer::new();
    let manager = client(&server, 1);
    let peer = manager.share(node("a", None)).unwrap();
    let oid = peer.id().unwrap();
    peer.write(|n: &mut Node| n.name = "unsaved".to_string()).unwrap();

    // The server takes the op, the local Node cannot apply it
    let err = manager
        .invoke_logical(&peer, LogicalOp::ListAdd(Value::Int(1)), &LockScope::new("l"))
        .unwrap_err();
    assert!(matches!(err, DsoError::InvalidDna { .. }));
    assert_eq!(server.commits.lock().len(), 1);

    assert_eq!(name_of(&peer), "a");
    assert_eq!(manager.lookup_if_local(oid).unwrap().version(), 2);
    assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unused_prefetched_records_expire_and_are_released() {
    let server = FakeServer::new();
    seed_chain(&server, 100, 103);
    let manager = client(&server, 1);

    let head = manager.lookup_object(id(100)).unwrap();
    assert_eq!(manager.dump().prefetched, 2);
    assert_eq!(server.held.lock().len(), 4);

    // Survives one sweep, goes on the next
    assert_eq!(manager.expire_prefetched(), 0);
    assert_eq!(manager.expire_prefetched(), 2);
    assert_eq!(manager.dump().prefetched, 0);

    let mut released = server.released.lock().clone();
    released.sort();
    assert_eq!(released, vec![id(102), id(103)]);
    assert_eq!(server.held.lock().iter().copied().collect::<Vec<_>>(), vec![id(100), id(101)]);

    // Still reachable on demand
    let second = head.read(|n: &Node| n.next.get().cloned()).unwrap().unwrap();
    let mut next = second.read(|n: &Node| n.next.clone()).unwrap();
    assert_eq!(name_of(&manager.resolve(&mut next).unwrap()), "n102");
    assert!(server.held.lock().contains(&id(102)));
}

#[test]
fn test_prefetch_cap_releases_oldest_batch() {
    let server = FakeServer::new();
    seed_chain(&server, 100, 102);
    seed_chain(&server, 200, 202);
    let config = ClientConfig {
        fault_depth: 0,
        max_prefetched_batches: 1,
        ..ClientConfig::default()
    };
    let manager = client_with(&server, 1, config);

    let _first = manager.lookup_object(id(100)).unwrap();
    let _second = manager.lookup_object(id(200)).unwrap();
    assert_eq!(manager.dump().prefetched, 2);

    assert_eq!(manager.run_cleanup(), 0);
    let mut released = server.released.lock().clone();
    released.sort();
    assert_eq!(released, vec![id(101), id(102)]);
    assert_eq!(
        server.held.lock().iter().copied().collect::<Vec<_>>(),
        vec![id(100), id(200), id(201), id(202)]
    );
}

#[test]
fn test_abandoned_fault_in_is_released() {
    let server = FakeServer::new();
    server.seed(Dna::new_object(id(100), "Unknown"));
    let manager = client(&server, 1);

    let err = manager.lookup_object(id(100)).unwrap_err();
    assert_eq!(err, DsoError::ClassNotFound("Unknown".to_string()));
    assert!(server.held.lock().contains(&id(100)));
    assert!(manager.lookup_if_local(id(100)).is_none());

    assert_eq!(manager.run_cleanup(), 0);
    assert_eq!(server.released.lock().clone(), vec![id(100)]);
    assert!(server.held.lock().is_empty());
}

#[test]
fn test_release_is_not_overtaken_by_a_refetch() {
    let server = FakeServer::new();
    seed_chain(&server, 100, 100);
    let manager = client(&server, 1);
    drop(manager.lookup_object(id(100)).unwrap());

    let (entered_tx, entered_rx) = bounded(1);
    let (proceed_tx, proceed_rx) = bounded(1);
    *server.release_gate.lock() = Some((entered_tx, proceed_rx));

    let cleaner = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.run_cleanup())
    };
    // The proxy is gone and the release is on its way to the server
    entered_rx.recv().unwrap();
    assert!(manager.lookup_if_local(id(100)).is_none());

    let faulting = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || manager.lookup_object(id(100)).unwrap())
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(server.fetches.load(Ordering::SeqCst), 1);
    proceed_tx.send(()).unwrap();

    assert_eq!(cleaner.join().unwrap(), 1);
    let peer = faulting.join().unwrap();
    assert_eq!(name_of(&peer), "n100");
    assert_eq!(server.fetches.load(Ordering::SeqCst), 2);
    assert_eq!(server.released.lock().clone(), vec![id(100)]);
    assert!(server.held.lock().contains(&id(100)));
}

#[test]
fn test_dump_serializes() {
    let server = FakeServer::new();
    let manager = client(&server, 7);
    let _peer = manager.share(node("x", None)).unwrap();
    manager.start().unwrap();
    let stats = manager.dump();
    assert_eq!(stats.proxies, 1);
    assert!(stats.cleaner_running);
    let json = stats.to_json().unwrap();
    assert!(json.contains("\"live_peers\": 1"));
    manager.stop();
}
