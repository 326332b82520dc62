//! RaftServer - drives timers for one node and exposes `RaftHandle`
//!
//! The driver loop owns the election timer and the heartbeat ticker. Elections
//! and replication rounds run as spawned tasks so a slow peer never delays the
//! loop itself.

use std::pin::pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::config::RaftConfig;
use super::raft_core::{NodeId, RaftCore, RaftState, RaftStatus};
use super::raft_node::{report, RaftNode, SharedCore};
use crate::storage::StorageError;
use crate::transport::Transport;

/// Errors that can occur during Raft operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaftError {
    /// This node is not the leader (includes leader hint if known)
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },
    /// Persisting consensus state failed
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    /// The node has been shut down
    #[error("raft node is shut down")]
    Shutdown,
}

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    core: SharedCore,
    replicate_now: Arc<Notify>,
    cancel: CancellationToken,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Submit a command without waiting for it to commit
    ///
    /// Returns the (index, term) it was appended at. The entry is only known to
    /// be committed once the state machine sees that index with this content.
    pub async fn start(&self, command: Vec<u8>) -> Result<(u64, u64), RaftError> {
        let mut core = self.core.lock().await;
        if core.is_killed() {
            return Err(RaftError::Shutdown);
        }
        match core.start(command)? {
            Some(placed) => {
                drop(core);
                self.replicate_now.notify_one();
                Ok(placed)
            }
            None => Err(RaftError::NotLeader {
                leader_hint: core.current_leader,
            }),
        }
    }

    /// Current term and whether this node believes it is leader
    pub async fn get_state(&self) -> (u64, bool) {
        let core = self.core.lock().await;
        (core.current_term, core.state == RaftState::Leader)
    }

    pub async fn status(&self) -> RaftStatus {
        self.core.lock().await.status()
    }

    /// Hand in a state machine snapshot covering entries up to `index`
    pub async fn snapshot(&self, index: u64, data: Vec<u8>) -> Result<(), RaftError> {
        let mut core = self.core.lock().await;
        if core.is_killed() {
            return Err(RaftError::Shutdown);
        }
        core.snapshot(index, data)?;
        Ok(())
    }

    /// Stop the timers and kill the core; the apply stream closes
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.core.lock().await.kill();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }
}

/// Raft server that runs the timers of one node
pub struct RaftServer<T: Transport> {
    id: NodeId,
    node: RaftNode<T>,
    replicate_now: Arc<Notify>,
    cancel: CancellationToken,
    config: RaftConfig,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a new RaftServer
    /// Returns the server and shared core for RPC handling
    pub fn new(core: RaftCore, transport: T, config: RaftConfig) -> (Self, SharedCore) {
        let id = core.id;
        let shared_core = Arc::new(tokio::sync::Mutex::new(core));
        let node = RaftNode::new(shared_core.clone(), transport, config.rpc_timeout);
        let server = Self {
            id,
            node,
            replicate_now: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            config,
        };
        (server, shared_core)
    }

    /// Start the server and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            id: self.id,
            core: self.node.shared_core(),
            replicate_now: self.replicate_now.clone(),
            cancel: self.cancel.clone(),
        };

        tokio::spawn(self.run());

        handle
    }

    /// Main server loop
    async fn run(self) {
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        // Use Delay behavior to prevent accumulated missed ticks from starving election timeout
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut election_timeout = self.config.random_election_timeout();
        let id = self.id;

        loop {
            let election_deadline = self.election_deadline(election_timeout).await;
            let election_sleep = pin!(sleep_until(election_deadline));

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break;
                }
                _ = self.replicate_now.notified() => {
                    self.spawn_replication();
                }
                _ = heartbeat_interval.tick() => {
                    if self.node.state().await == RaftState::Leader {
                        // Update our own heartbeat timer to prevent election timeout
                        self.node.shared_core().lock().await.last_heartbeat = Instant::now();
                        self.spawn_replication();
                    }
                }
                _ = election_sleep => {
                    if self.node.state().await != RaftState::Leader
                        && self.has_election_timed_out(election_timeout).await
                    {
                        election_timeout = self.config.random_election_timeout();
                        // Becoming candidate happens inline so the next deadline sees the reset timer
                        match self.node.start_election().await {
                            Ok(true) => self.spawn_replication(),
                            Ok(false) => self.spawn_vote_collection(),
                            Err(e) => {
                                report(id, "election", Err(e));
                            }
                        }
                    }
                }
            }
        }

        self.node.shared_core().lock().await.kill();
        info!(node = id, "raft server stopped");
    }

    fn spawn_vote_collection(&self) {
        let id = self.id;
        let node = self.node.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = async {
                    if report(id, "election", node.request_votes().await) {
                        // Immediately send heartbeat to establish leadership
                        report(id, "replication", node.replicate().await);
                    }
                } => {}
            }
        });
    }

    fn spawn_replication(&self) {
        let id = self.id;
        let node = self.node.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = node.replicate() => {
                    report(id, "replication", result);
                }
            }
        });
    }

    /// Get election deadline based on last_heartbeat from core
    async fn election_deadline(&self, timeout: Duration) -> Instant {
        self.node.shared_core().lock().await.last_heartbeat + timeout
    }

    /// Check if election has actually timed out (last_heartbeat + timeout < now)
    async fn has_election_timed_out(&self, timeout: Duration) -> bool {
        Instant::now() >= self.election_deadline(timeout).await
    }
}
