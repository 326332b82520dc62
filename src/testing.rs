//! Testing utilities for cluster integration tests
//!
//! - `Cluster`: in-process nodes over an `InMemoryNetwork`, with crash,
//!   restart, partition and a record of every entry each node applied
//! - `HttpCluster`: nodes on loopback sockets talking real HTTP

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::error;

use crate::api::kv_http::{create_kv_router, HttpKvService};
use crate::core::config::{ClientConfig, KvConfig, RaftConfig};
use crate::core::raft_core::{ApplyMsg, LogEntry, NodeId, RaftCore};
use crate::core::raft_server::RaftServer;
use crate::kv::client::{Clerk, ClientError, KvService};
use crate::kv::command::ClientId;
use crate::kv::server::KvServer;
use crate::state_machine::StudentRecord;
use crate::storage::memory::MemoryStorage;
use crate::transport::http::{create_raft_router, HttpTransport};
use crate::transport::inmemory::{InMemoryNetwork, NetworkConditions};
use crate::transport::TransportError;

/// Pseudo node id clients use on the in-memory network
///
/// Clients reach a node only while `CLIENT` and the node are in the same
/// partition group.
pub const CLIENT: NodeId = 0;

/// Entries one node has applied, by index
pub type AppliedLog = Arc<Mutex<BTreeMap<u64, LogEntry>>>;

/// Timers scaled for tests
pub fn fast_raft_config() -> RaftConfig {
    RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
        .with_rpc_timeout(Duration::from_millis(100))
}

type Servers = Arc<Mutex<HashMap<NodeId, KvServer>>>;

/// A cluster of in-process nodes
pub struct Cluster {
    network: InMemoryNetwork,
    ids: Vec<NodeId>,
    raft_config: RaftConfig,
    kv_config: KvConfig,
    servers: Servers,
    storages: HashMap<NodeId, MemoryStorage>,
    applied: HashMap<NodeId, AppliedLog>,
    violations: Arc<Mutex<Vec<String>>>,
}

impl Cluster {
    /// Start `count` nodes (ids 1..=count) on a reliable network
    pub fn new(count: usize) -> Self {
        Self::with_config(count, fast_raft_config(), KvConfig::default(), NetworkConditions::reliable())
    }

    pub fn with_config(
        count: usize,
        raft_config: RaftConfig,
        kv_config: KvConfig,
        conditions: NetworkConditions,
    ) -> Self {
        let ids: Vec<NodeId> = (1..=count as u64).collect();
        let mut cluster = Cluster {
            network: InMemoryNetwork::with_conditions(conditions),
            ids: ids.clone(),
            raft_config,
            kv_config,
            servers: Arc::default(),
            storages: HashMap::new(),
            applied: HashMap::new(),
            violations: Arc::default(),
        };
        for id in ids {
            cluster.storages.insert(id, MemoryStorage::new());
            cluster.applied.insert(id, Arc::default());
            cluster.start_node(id);
        }
        cluster
    }

    fn start_node(&mut self, id: NodeId) {
        let peers = self.ids.iter().copied().filter(|&p| p != id).collect();
        let storage = self.storages[&id].clone();

        let (core_tx, core_rx) = unbounded_channel();
        let (kv_tx, kv_rx) = unbounded_channel();
        let core = match RaftCore::new(id, peers, Box::new(storage), core_tx) {
            Ok(core) => core,
            Err(e) => panic!("node {} failed to load its state: {}", id, e),
        };
        tokio::spawn(apply_tap(
            id,
            core_rx,
            kv_tx,
            self.applied[&id].clone(),
            self.violations.clone(),
        ));

        let (server, shared) = RaftServer::new(core, self.network.transport(id), self.raft_config.clone());
        self.network.register(id, shared);
        let kv = KvServer::start(server.start(), kv_rx, self.kv_config.clone());
        self.servers.lock().insert(id, kv);
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    /// The running incarnation of node `id`
    pub fn kv(&self, id: NodeId) -> Option<KvServer> {
        self.servers.lock().get(&id).cloned()
    }

    pub fn is_running(&self, id: NodeId) -> bool {
        self.servers.lock().contains_key(&id)
    }

    /// Kill node `id`; its durable state is kept for `restart`
    pub async fn crash(&mut self, id: NodeId) {
        let kv = self.servers.lock().remove(&id);
        if let Some(kv) = kv {
            kv.kill().await;
        }
        self.network.unregister(id);
        // The dead incarnation must not touch what the next one loads
        let snapshot = self.storages[&id].deep_copy();
        self.storages.insert(id, snapshot);
    }

    /// Start a fresh incarnation of `id` from its durable state
    pub async fn restart(&mut self, id: NodeId) {
        if self.is_running(id) {
            self.crash(id).await;
        }
        self.start_node(id);
    }

    pub fn disconnect(&self, id: NodeId) {
        self.network.disconnect(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.network.reconnect(id);
    }

    /// Split the nodes in two; clients stay with `majority`
    pub fn partition(&self, majority: &[NodeId], minority: &[NodeId]) {
        let mut with_client = vec![CLIENT];
        with_client.extend_from_slice(majority);
        self.network.partition(&[&with_client, minority]);
    }

    pub fn heal(&self) {
        self.network.heal();
    }

    /// Running nodes that currently believe they lead, with their terms
    pub async fn leaders(&self) -> Vec<(NodeId, u64)> {
        let servers: Vec<KvServer> = self.servers.lock().values().cloned().collect();
        let mut leaders = Vec::new();
        for kv in servers {
            let (term, is_leader) = kv.raft().get_state().await;
            if is_leader {
                leaders.push((kv.id(), term));
            }
        }
        leaders
    }

    /// Poll until some node leads; returns the leader with the highest term
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(&(id, _)) = self.leaders().await.iter().max_by_key(|(_, term)| *term) {
                return Some(id);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Poll until node `id` has applied at least `index`
    pub async fn wait_for_applied(&self, id: NodeId, index: u64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(kv) = self.kv(id) {
                if kv.status().await.applied_index >= index {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// A client session reaching nodes through the network's client links
    pub fn clerk(&self) -> Clerk<ClusterClient> {
        self.clerk_with(ClientConfig::default())
    }

    pub fn clerk_with(&self, config: ClientConfig) -> Clerk<ClusterClient> {
        let links = self
            .ids
            .iter()
            .map(|&id| ClusterClient {
                id,
                servers: self.servers.clone(),
                network: self.network.clone(),
            })
            .collect();
        Clerk::new(links, config)
    }

    /// Entries node `id` has applied across all its incarnations
    pub fn applied(&self, id: NodeId) -> BTreeMap<u64, LogEntry> {
        self.applied[&id].lock().clone()
    }

    /// Every index applied by more than one node carries the same entry everywhere
    pub fn check_applied_agreement(&self) -> Result<(), String> {
        if let Some(violation) = self.violations.lock().first() {
            return Err(violation.clone());
        }
        let mut seen: HashMap<u64, (NodeId, LogEntry)> = HashMap::new();
        for &id in &self.ids {
            for (index, entry) in self.applied(id) {
                match seen.get(&index) {
                    Some((other, existing)) if *existing != entry => {
                        return Err(format!(
                            "nodes {} and {} applied different entries at index {}",
                            other, id, index
                        ));
                    }
                    Some(_) => {}
                    None => {
                        seen.insert(index, (id, entry));
                    }
                }
            }
        }
        Ok(())
    }

    /// Kill every node
    pub async fn shutdown(&self) {
        let servers: Vec<KvServer> = self.servers.lock().drain().map(|(_, kv)| kv).collect();
        for kv in servers {
            kv.kill().await;
        }
    }
}

/// Records applied entries on their way from a core to its `KvServer`
async fn apply_tap(
    id: NodeId,
    mut from_core: UnboundedReceiver<ApplyMsg>,
    to_kv: UnboundedSender<ApplyMsg>,
    applied: AppliedLog,
    violations: Arc<Mutex<Vec<String>>>,
) {
    while let Some(msg) = from_core.recv().await {
        if let ApplyMsg::Entry(entry) = &msg {
            let mut applied = applied.lock();
            match applied.get(&entry.index) {
                Some(previous) if previous != entry => {
                    let violation = format!("node {} applied two different entries at index {}", id, entry.index);
                    error!(node = id, index = entry.index, "{}", violation);
                    violations.lock().push(violation);
                }
                Some(_) => {}
                None => {
                    applied.insert(entry.index, entry.clone());
                }
            }
        }
        if to_kv.send(msg).is_err() {
            break;
        }
    }
}

/// Client link to one node of a `Cluster`
///
/// Calls fail with a transport error while the node is down or cut off from
/// `CLIENT`, and replies are lost at the network's reply-loss rate.
pub struct ClusterClient {
    id: NodeId,
    servers: Servers,
    network: InMemoryNetwork,
}

impl ClusterClient {
    fn server(&self) -> Result<KvServer, ClientError> {
        if !self.network.is_connected(CLIENT, self.id) {
            return Err(TransportError::ConnectionFailed.into());
        }
        self.servers
            .lock()
            .get(&self.id)
            .cloned()
            .ok_or(TransportError::NodeNotFound.into())
    }

    fn deliver<T>(&self, reply: Result<T, ClientError>) -> Result<T, ClientError> {
        let reply_loss = self.network.conditions().reply_loss;
        if !self.network.is_connected(CLIENT, self.id) || rand::rng().random_bool(reply_loss) {
            return Err(TransportError::Timeout.into());
        }
        reply
    }
}

#[async_trait]
impl KvService for ClusterClient {
    async fn get(&self, key: &str, client_id: ClientId, seq: u64) -> Result<StudentRecord, ClientError> {
        let server = self.server()?;
        let reply = KvService::get(&server, key, client_id, seq).await;
        self.deliver(reply)
    }

    async fn put(
        &self,
        key: &str,
        record: StudentRecord,
        client_id: ClientId,
        seq: u64,
    ) -> Result<(), ClientError> {
        let server = self.server()?;
        let reply = KvService::put(&server, key, record, client_id, seq).await;
        self.deliver(reply)
    }

    async fn list_keys(&self) -> Result<Vec<String>, ClientError> {
        let server = self.server()?;
        let reply = KvService::list_keys(&server).await;
        self.deliver(reply)
    }
}

/// A node of an `HttpCluster`
pub struct HttpNode {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub kv: KvServer,
    http_shutdown_tx: Option<oneshot::Sender<()>>,
}

/// A cluster whose nodes talk to each other and to clients over HTTP
pub struct HttpCluster {
    pub nodes: Vec<HttpNode>,
}

impl HttpCluster {
    pub async fn start(count: usize) -> std::io::Result<Self> {
        let ids: Vec<NodeId> = (1..=count as u64).collect();

        // Bind every listener first so each node knows all peer addresses
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();
        for &id in &ids {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            addrs.insert(id, addr.to_string());
            listeners.push((id, listener, addr));
        }

        let config = fast_raft_config();
        let mut nodes = Vec::new();
        for (id, listener, addr) in listeners {
            let peers: HashMap<NodeId, String> = addrs
                .iter()
                .filter(|(&peer_id, _)| peer_id != id)
                .map(|(&peer_id, addr)| (peer_id, addr.clone()))
                .collect();
            let peer_ids = peers.keys().copied().collect();

            let transport = HttpTransport::new(peers, config.rpc_timeout)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            let (tx, rx) = unbounded_channel();
            let core = RaftCore::new(id, peer_ids, Box::new(MemoryStorage::new()), tx)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            let (server, shared_core) = RaftServer::new(core, transport, config.clone());
            let kv = KvServer::start(server.start(), rx, KvConfig::default());

            let app = create_raft_router(shared_core).merge(create_kv_router(kv.clone()));
            let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel::<()>();
            tokio::spawn(async move {
                let result = axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = http_shutdown_rx.await;
                    })
                    .await;
                if let Err(e) = result {
                    error!(node = id, error = %e, "http server failed");
                }
            });

            nodes.push(HttpNode {
                id,
                addr,
                kv,
                http_shutdown_tx: Some(http_shutdown_tx),
            });
        }

        Ok(HttpCluster { nodes })
    }

    pub fn addrs(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.addr.to_string()).collect()
    }

    /// A client session over HTTP to every node
    pub fn clerk(&self) -> reqwest::Result<Clerk<HttpKvService>> {
        let services = self
            .addrs()
            .into_iter()
            .map(|addr| HttpKvService::new(addr, Duration::from_secs(2)))
            .collect::<reqwest::Result<Vec<_>>>()?;
        Ok(Clerk::new(services, ClientConfig::default()))
    }

    /// Index into `nodes` of a live leader
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            for (i, node) in self.nodes.iter().enumerate() {
                if node.http_shutdown_tx.is_some() && node.kv.raft().get_state().await.1 {
                    return Some(i);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Stop a node's HTTP server and kill it
    pub async fn shutdown_node(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        if let Some(tx) = node.http_shutdown_tx.take() {
            let _ = tx.send(());
        }
        node.kv.kill().await;
    }

    pub async fn shutdown(mut self) {
        for i in 0..self.nodes.len() {
            self.shutdown_node(i).await;
        }
    }
}
