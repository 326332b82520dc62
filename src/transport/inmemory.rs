//! In-memory transport implementation for testing
//!
//! Every node of a test cluster shares one `InMemoryNetwork`. A call locks
//! the target's core directly; the network only decides whether, and after
//! how long, a message gets through. Messages are never corrupted, but can
//! be lost in either direction, delayed, or blocked by crashes and partitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

use super::{Transport, TransportError};
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, NodeId,
    RaftCore, RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::SharedCore;
use crate::storage::StorageError;

/// Message loss and delay applied to every call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkConditions {
    /// Probability a request never reaches the target
    pub request_loss: f64,
    /// Probability the target handles a request but its reply is lost
    pub reply_loss: f64,
    /// Each delivery is delayed uniformly in `[0, max_delay]`
    pub max_delay: Duration,
}

impl NetworkConditions {
    pub fn reliable() -> Self {
        NetworkConditions {
            request_loss: 0.0,
            reply_loss: 0.0,
            max_delay: Duration::ZERO,
        }
    }

    /// 10% loss each way with up to 27ms of delay
    pub fn unreliable() -> Self {
        NetworkConditions {
            request_loss: 0.1,
            reply_loss: 0.1,
            max_delay: Duration::from_millis(27),
        }
    }
}

impl Default for NetworkConditions {
    fn default() -> Self {
        Self::reliable()
    }
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, SharedCore>,
    disconnected: HashSet<NodeId>,
    /// Partition group per node; nodes talk only within the same group
    groups: HashMap<NodeId, usize>,
    conditions: NetworkConditions,
    rpc_count: u64,
}

impl NetworkState {
    fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        !self.disconnected.contains(&from)
            && !self.disconnected.contains(&to)
            && self.groups.get(&from) == self.groups.get(&to)
    }
}

/// Shared registry of in-process nodes and the links between them
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    /// Create a reliable network with no nodes
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conditions(conditions: NetworkConditions) -> Self {
        let network = Self::default();
        network.set_conditions(conditions);
        network
    }

    pub fn set_conditions(&self, conditions: NetworkConditions) {
        self.state.lock().conditions = conditions;
    }

    pub fn conditions(&self) -> NetworkConditions {
        self.state.lock().conditions
    }

    /// Make `core` reachable as node `id`, replacing any previous incarnation
    pub fn register(&self, id: NodeId, core: SharedCore) {
        self.state.lock().nodes.insert(id, core);
    }

    /// Remove a crashed node; calls to it fail with `NodeNotFound`
    pub fn unregister(&self, id: NodeId) {
        self.state.lock().nodes.remove(&id);
    }

    /// Cut every link to and from `id`
    pub fn disconnect(&self, id: NodeId) {
        self.state.lock().disconnected.insert(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.state.lock().disconnected.remove(&id);
    }

    /// Split the cluster; nodes in different groups cannot reach each other
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut state = self.state.lock();
        state.groups.clear();
        for (group, members) in groups.iter().enumerate() {
            for &id in members.iter() {
                state.groups.insert(id, group);
            }
        }
    }

    /// Remove partitions and reconnect every node
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.groups.clear();
        state.disconnected.clear();
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.state.lock().can_reach(from, to)
    }

    /// Total calls attempted through this network
    pub fn rpc_count(&self) -> u64 {
        self.state.lock().rpc_count
    }

    /// Transport used by node `from` to reach its peers
    pub fn transport(&self, from: NodeId) -> InMemoryTransport {
        InMemoryTransport {
            from,
            network: self.clone(),
        }
    }
}

/// One node's view of the in-memory network
#[derive(Clone)]
pub struct InMemoryTransport {
    from: NodeId,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    async fn call<R, F>(&self, target: NodeId, handler: F) -> Result<R, TransportError>
    where
        R: Send,
        F: FnOnce(&mut RaftCore) -> Result<R, StorageError> + Send,
    {
        let (core, delay, lose_request, lose_reply) = {
            let mut state = self.network.state.lock();
            state.rpc_count += 1;
            if !state.can_reach(self.from, target) {
                return Err(TransportError::ConnectionFailed);
            }
            let core = state.nodes.get(&target).cloned().ok_or(TransportError::NodeNotFound)?;

            let conditions = state.conditions;
            let mut rng = rand::rng();
            let delay = if conditions.max_delay.is_zero() {
                Duration::ZERO
            } else {
                Duration::from_micros(rng.random_range(0..=conditions.max_delay.as_micros() as u64))
            };
            (
                core,
                delay,
                rng.random_bool(conditions.request_loss),
                rng.random_bool(conditions.reply_loss),
            )
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if lose_request {
            trace!(from = self.from, to = target, "request lost");
            return Err(TransportError::Timeout);
        }

        let reply = {
            let mut core = core.lock().await;
            if core.is_killed() {
                return Err(TransportError::ConnectionFailed);
            }
            handler(&mut core).map_err(|e| TransportError::Remote(e.to_string()))?
        };

        // Links may have been cut while the request was in flight
        if lose_reply || !self.network.is_connected(self.from, target) {
            trace!(from = self.from, to = target, "reply lost");
            return Err(TransportError::Timeout);
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.call(target, move |core| core.handle_request_vote(&args)).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.call(target, move |core| {
            core.handle_append_entries(&args).map(|output| output.result)
        })
        .await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.call(target, move |core| core.handle_install_snapshot(&args)).await
    }
}
