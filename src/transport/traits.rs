//! Transport abstraction for Raft RPC communication

use async_trait::async_trait;
use thiserror::Error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, NodeId,
    RequestVoteArgs, RequestVoteResult,
};

/// Transport abstraction for Raft RPC communication
///
/// A call either reaches the target exactly once or not at all; callers
/// treat every error as "message lost" and retry on their own schedule.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    /// Send an InstallSnapshot RPC to a peer node
    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection to the target node failed
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("node not found")]
    NodeNotFound,
    /// Target received the request but could not produce a reply
    #[error("remote error: {0}")]
    Remote(String),
}
