//! A server and its clients in one process

use crate::config::DsoConfig;
use crate::loopback::LoopbackRemote;
use dso_client::{
    CacheStats, ClassRegistry, ClientObjectManager, ClientStats, Clock, MapHandle, RemoteObjectManager,
    SERVER_MAP_CLASS, ServerMap, ServerMapRegistry, SystemClock,
};
use dso_common::{ClientId, DsoResult, ObjectId};
use dso_server::{
    DgcResultContext, GarbageCollectorEventListener, MapChange, MapChangeListener, ObjectManager,
    ObjectManagerStats,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// One connected client: its object manager and its server maps.
#[derive(Debug)]
pub struct ClientNode {
    remote: Arc<LoopbackRemote>,
    objects: Arc<ClientObjectManager>,
    maps: Arc<ServerMapRegistry>,
}

impl ClientNode {
    /// Client id.
    pub fn id(&self) -> ClientId {
        self.remote.client()
    }

    /// Object manager.
    pub fn objects(&self) -> &Arc<ClientObjectManager> {
        &self.objects
    }

    /// Server map caches.
    pub fn maps(&self) -> &Arc<ServerMapRegistry> {
        &self.maps
    }

    /// Create a server map reachable from root `name`.
    pub fn create_map(&self, name: &str) -> DsoResult<Arc<ServerMap>> {
        let handle = self.objects.share(MapHandle)?;
        let id = self.objects.create_or_replace_root(name, &handle)?;
        Ok(self.maps.map(id))
    }

    /// The server map bound to root `name`.
    pub fn open_map(&self, name: &str) -> DsoResult<Option<Arc<ServerMap>>> {
        Ok(self.remote.lookup_root(name)?.map(|id| self.maps.map(id)))
    }

    fn shutdown(&self) {
        self.objects.stop();
        self.maps.stop();
    }
}

/// Introspection snapshot of a whole node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    /// Server side
    pub server: ObjectManagerStats,
    /// Each client's object manager
    pub clients: Vec<ClientStats>,
    /// Each client's map caches
    pub maps: Vec<Vec<CacheStats>>,
}

impl NodeStats {
    /// Pretty JSON for dump tooling.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Server plus connected clients. DGC results and map changes are fanned
/// out to the clients the way a networked deployment would broadcast them.
#[derive(Debug)]
pub struct DsoNode {
    config: DsoConfig,
    server: Arc<ObjectManager>,
    clients: RwLock<Vec<Arc<ClientNode>>>,
    next_client: AtomicU64,
}

impl DsoNode {
    /// Build and start a node.
    pub fn start(config: DsoConfig) -> std::io::Result<Arc<Self>> {
        let server = ObjectManager::new(config.server.clone());
        server.start()?;

        let node = Arc::new(Self {
            config,
            server,
            clients: RwLock::new(Vec::new()),
            next_client: AtomicU64::new(1),
        });

        let fanout = Arc::new(ClientFanout {
            node: Arc::downgrade(&node),
        });
        node.server.add_gc_listener(fanout.clone());
        if node.config.map.invalidate_on_change {
            node.server.add_map_listener(fanout);
        }
        tracing::info!(target: "dso::node", gc_enabled = node.config.server.gc_enabled, "node started");
        Ok(node)
    }

    /// Effective configuration.
    pub fn config(&self) -> &DsoConfig {
        &self.config
    }

    /// The object manager.
    pub fn server(&self) -> &Arc<ObjectManager> {
        &self.server
    }

    /// Connect a client that can fault in `classes`, with wall-clock expiry.
    pub fn connect(&self, classes: ClassRegistry) -> std::io::Result<Arc<ClientNode>> {
        self.connect_with_clock(classes, Arc::new(SystemClock::default()))
    }

    /// Connect a client whose map caches read time from `clock`.
    pub fn connect_with_clock(
        &self,
        mut classes: ClassRegistry,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Arc<ClientNode>> {
        let client = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        self.server.client_connected(client);

        if !classes.contains(SERVER_MAP_CLASS) {
            classes.register_default::<MapHandle>(SERVER_MAP_CLASS);
        }
        let remote = Arc::new(LoopbackRemote::new(Arc::clone(&self.server), client));
        let objects = ClientObjectManager::new(client, self.config.client.clone(), remote.clone(), classes);
        let maps = ServerMapRegistry::new(remote.clone(), self.config.map.clone(), clock);
        objects.start()?;
        maps.start()?;

        let node = Arc::new(ClientNode {
            remote,
            objects,
            maps,
        });
        self.clients.write().push(Arc::clone(&node));
        tracing::debug!(target: "dso::node", %client, "client connected");
        Ok(node)
    }

    /// Disconnect a client. Everything it held is released on the server.
    pub fn disconnect(&self, client: &ClientNode) {
        let id = client.id();
        client.shutdown();
        self.clients.write().retain(|c| c.id() != id);
        self.server.client_disconnected(id);
    }

    /// Connected clients.
    pub fn clients(&self) -> Vec<Arc<ClientNode>> {
        self.clients.read().clone()
    }

    /// Drain every client's cleanup queue, then run a full DGC pass.
    pub fn gc(&self) -> DsoResult<DgcResultContext> {
        for client in self.clients() {
            client.objects.run_cleanup();
        }
        self.server.gc()
    }

    /// Drain cleanup queues, then run a young-generation pass.
    pub fn gc_young(&self) -> DsoResult<DgcResultContext> {
        for client in self.clients() {
            client.objects.run_cleanup();
        }
        self.server.gc_young()
    }

    /// Introspection snapshot.
    pub fn dump(&self) -> NodeStats {
        let clients = self.clients();
        NodeStats {
            server: self.server.dump(),
            clients: clients.iter().map(|c| c.objects.dump()).collect(),
            maps: clients.iter().map(|c| c.maps.stats()).collect(),
        }
    }

    /// Stop every background thread.
    pub fn shutdown(&self) {
        for client in self.clients() {
            client.shutdown();
        }
        self.server.stop();
        tracing::info!(target: "dso::node", "node stopped");
    }
}

struct ClientFanout {
    node: Weak<DsoNode>,
}

impl ClientFanout {
    fn clients(&self) -> Vec<Arc<ClientNode>> {
        self.node.upgrade().map(|node| node.clients()).unwrap_or_default()
    }
}

impl GarbageCollectorEventListener for ClientFanout {
    fn gc_completed(&self, result: &DgcResultContext) {
        if result.collected.is_empty() {
            return;
        }
        for client in self.clients() {
            client.objects.handle_objects_collected(&result.collected);
            client.maps.remove_entries_for_object_ids(&result.collected);
        }
    }
}

impl MapChangeListener for ClientFanout {
    fn map_changed(&self, origin: ClientId, map_id: ObjectId, change: &MapChange) {
        for client in self.clients() {
            if client.id() == origin {
                continue;
            }
            match change {
                MapChange::Keys(keys) => client.maps.invalidate(map_id, keys),
                MapChange::Cleared => client.maps.invalidate_all(map_id),
            };
        }
    }
}
