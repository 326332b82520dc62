//! RaftNode - fans consensus RPCs out to peers
//!
//! The core lock is held only while building requests and while folding a
//! reply back in, never across a network await.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::raft_core::{
    AppendEntriesResult, AppendSent, InstallSnapshotResult, NodeId, PeerRequest, RaftCore, RaftState,
    RequestVoteArgs,
};
use crate::storage::StorageError;
use crate::transport::{Transport, TransportError};

/// Shared reference to RaftCore
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// High-level Raft node that handles consensus operations
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: Arc<T>,
    rpc_timeout: Duration,
}

impl<T: Transport> Clone for RaftNode<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            transport: self.transport.clone(),
            rpc_timeout: self.rpc_timeout,
        }
    }
}

impl<T: Transport> RaftNode<T> {
    /// Create a new RaftNode
    pub fn new(core: SharedCore, transport: T, rpc_timeout: Duration) -> Self {
        Self {
            core,
            transport: Arc::new(transport),
            rpc_timeout,
        }
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    async fn bounded<R>(
        &self,
        call: impl std::future::Future<Output = Result<R, TransportError>>,
    ) -> Result<R, TransportError> {
        tokio::time::timeout(self.rpc_timeout, call)
            .await
            .unwrap_or(Err(TransportError::Timeout))
    }

    /// Start an election
    /// Returns true if this node won outright (single-node cluster)
    pub async fn start_election(&self) -> Result<bool, StorageError> {
        let mut core = self.core.lock().await;
        if core.is_killed() {
            return Ok(false);
        }
        core.start_election()?;
        Ok(core.state == RaftState::Leader)
    }

    /// Request votes from all peers (sends requests concurrently)
    /// Returns true if became leader
    pub async fn request_votes(&self) -> Result<bool, StorageError> {
        let (args, peers) = {
            let core = self.core.lock().await;
            if core.state != RaftState::Candidate {
                return Ok(false);
            }
            let args = RequestVoteArgs {
                term: core.current_term,
                candidate_id: core.id,
                last_log_index: core.last_log_index(),
                last_log_term: core.last_log_term(),
            };
            (args, core.peers.clone())
        };

        let mut futures: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                async move {
                    let result = self.bounded(self.transport.request_vote(peer_id, args)).await;
                    (peer_id, result)
                }
            })
            .collect();

        while let Some((peer_id, result)) = futures.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    if core.handle_request_vote_result(peer_id, &result)? {
                        return Ok(true); // Became leader, don't wait for remaining
                    }
                    if core.state != RaftState::Candidate || core.current_term != args.term {
                        return Ok(false);
                    }
                }
                Err(e) => debug!(peer = peer_id, error = %e, "vote request failed"),
            }
        }

        Ok(false)
    }

    /// One replication round: heartbeat, log catch-up or snapshot per peer
    /// Returns whether this node is still leader afterwards
    pub async fn replicate(&self) -> Result<bool, StorageError> {
        let requests = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader || core.is_killed() {
                return Ok(false);
            }
            core.replication_requests()
        };

        let mut futures: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer_id, request)| async move {
                let outcome = self.send(peer_id, request).await;
                (peer_id, outcome)
            })
            .collect();

        while let Some((peer_id, outcome)) = futures.next().await {
            let mut core = self.core.lock().await;
            match outcome {
                Sent::Append(sent, Ok(result)) => {
                    core.handle_append_entries_result(peer_id, &sent, &result)?;
                }
                Sent::Snapshot {
                    term,
                    last_included_index,
                    result: Ok(result),
                } => {
                    core.handle_install_snapshot_result(peer_id, term, last_included_index, &result)?;
                }
                Sent::Append(_, Err(e)) | Sent::Snapshot { result: Err(e), .. } => {
                    debug!(node = core.id, peer = peer_id, error = %e, "replication rpc failed");
                }
            }
            if core.state != RaftState::Leader {
                return Ok(false);
            }
        }

        Ok(self.core.lock().await.state == RaftState::Leader)
    }

    async fn send(&self, peer_id: NodeId, request: PeerRequest) -> Sent {
        match request {
            PeerRequest::Append(args) => {
                let sent = AppendSent::of(&args);
                Sent::Append(
                    sent,
                    self.bounded(self.transport.append_entries(peer_id, args)).await,
                )
            }
            PeerRequest::Snapshot(args) => {
                let term = args.term;
                let last_included_index = args.last_included_index;
                // Snapshots can be large; give them more room than a heartbeat
                let result = tokio::time::timeout(
                    self.rpc_timeout * 10,
                    self.transport.install_snapshot(peer_id, args),
                )
                .await
                .unwrap_or(Err(TransportError::Timeout));
                Sent::Snapshot {
                    term,
                    last_included_index,
                    result,
                }
            }
        }
    }

    /// Get current state
    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Get commit index
    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }
}

enum Sent {
    Append(AppendSent, Result<AppendEntriesResult, TransportError>),
    Snapshot {
        term: u64,
        last_included_index: u64,
        result: Result<InstallSnapshotResult, TransportError>,
    },
}

/// Log a storage failure from a background round
pub(crate) fn report(node: NodeId, what: &str, result: Result<bool, StorageError>) -> bool {
    match result {
        Ok(flag) => flag,
        Err(e) => {
            error!(node, error = %e, "{} failed to persist state", what);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raft_core::{ApplyMsg, Payload};
    use crate::storage::memory::MemoryStorage;
    use crate::transport::inmemory::InMemoryNetwork;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct TestNode {
        node: RaftNode<crate::transport::inmemory::InMemoryTransport>,
        _rx: UnboundedReceiver<ApplyMsg>,
    }

    fn cluster(ids: &[NodeId]) -> (InMemoryNetwork, Vec<TestNode>) {
        let network = InMemoryNetwork::new();
        let nodes = ids
            .iter()
            .map(|&id| {
                let peers = ids.iter().copied().filter(|&p| p != id).collect();
                let (tx, rx) = unbounded_channel();
                let core = RaftCore::new(id, peers, Box::new(MemoryStorage::new()), tx).unwrap();
                let shared = Arc::new(Mutex::new(core));
                network.register(id, shared.clone());
                TestNode {
                    node: RaftNode::new(shared, network.transport(id), Duration::from_millis(100)),
                    _rx: rx,
                }
            })
            .collect();
        (network, nodes)
    }

    #[tokio::test]
    async fn test_election_via_node() {
        let (_network, nodes) = cluster(&[1, 2, 3]);

        assert!(!nodes[0].node.start_election().await.unwrap());
        assert!(nodes[0].node.request_votes().await.unwrap());
        assert_eq!(nodes[0].node.state().await, RaftState::Leader);
        assert_eq!(nodes[1].node.shared_core().lock().await.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_single_node_wins_immediately() {
        let (_network, nodes) = cluster(&[1]);
        assert!(nodes[0].node.start_election().await.unwrap());
        assert_eq!(nodes[0].node.commit_index().await, 1);
    }

    #[tokio::test]
    async fn test_replicate_commits_on_majority() {
        let (_network, nodes) = cluster(&[1, 2, 3]);
        nodes[0].node.start_election().await.unwrap();
        nodes[0].node.request_votes().await.unwrap();

        nodes[0]
            .node
            .shared_core()
            .lock()
            .await
            .start(b"put x".to_vec())
            .unwrap();
        assert!(nodes[0].node.replicate().await.unwrap());

        assert_eq!(nodes[0].node.commit_index().await, 2);
        let follower = nodes[1].node.shared_core();
        let follower = follower.lock().await;
        assert_eq!(follower.log.len(), 2);
        assert_eq!(follower.log[1].payload, Payload::Command(b"put x".to_vec()));
    }

    #[tokio::test]
    async fn test_isolated_candidate_cannot_win() {
        let (network, nodes) = cluster(&[1, 2, 3]);
        network.disconnect(1);

        nodes[0].node.start_election().await.unwrap();
        assert!(!nodes[0].node.request_votes().await.unwrap());
        assert_eq!(nodes[0].node.state().await, RaftState::Candidate);
    }

    #[tokio::test]
    async fn test_isolated_leader_cannot_commit() {
        let (network, nodes) = cluster(&[1, 2, 3]);
        nodes[0].node.start_election().await.unwrap();
        nodes[0].node.request_votes().await.unwrap();
        nodes[0].node.replicate().await.unwrap();
        assert_eq!(nodes[0].node.commit_index().await, 1);

        network.disconnect(1);
        nodes[0]
            .node
            .shared_core()
            .lock()
            .await
            .start(b"lost".to_vec())
            .unwrap();
        nodes[0].node.replicate().await.unwrap();

        assert_eq!(nodes[0].node.commit_index().await, 1);
    }

    #[tokio::test]
    async fn test_stale_leader_steps_down_on_replicate() {
        let (_network, nodes) = cluster(&[1, 2, 3]);
        nodes[0].node.start_election().await.unwrap();
        nodes[0].node.request_votes().await.unwrap();

        // Another node moved on to a later term
        nodes[1].node.shared_core().lock().await.current_term = 5;

        assert!(!nodes[0].node.replicate().await.unwrap());
        let core = nodes[0].node.shared_core();
        let core = core.lock().await;
        assert_eq!(core.state, RaftState::Follower);
        assert_eq!(core.current_term, 5);
    }
}
