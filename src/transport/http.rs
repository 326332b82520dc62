//! HTTP transport implementation for Raft RPC
//!
//! Uses axum for the server and reqwest for the client. Bodies are JSON.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::{Transport, TransportError};
use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult, NodeId,
    RequestVoteArgs, RequestVoteResult,
};
use crate::core::raft_node::SharedCore;
use crate::storage::StorageError;

/// HTTP transport for Raft RPC communication
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:8001")
    peers: HashMap<NodeId, String>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport with peer addresses
    pub fn new(peers: HashMap<NodeId, String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpTransport { peers, client })
    }

    async fn post<A, R>(&self, target: NodeId, path: &str, args: &A) -> Result<R, TransportError>
    where
        A: Serialize + Sync,
        R: DeserializeOwned,
    {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}{}", addr, path);

        let response = self.client.post(&url).json(args).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Remote(format!("{}: {}", status, body)));
        }

        response.json::<R>().await.map_err(classify)
    }
}

fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::ConnectionFailed
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post(target, "/raft/request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post(target, "/raft/append_entries", &args).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.post(target, "/raft/install_snapshot", &args).await
    }
}

type RpcResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Create an axum router for handling Raft RPCs
pub fn create_raft_router(core: SharedCore) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .with_state(core)
}

fn shut_down() -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, "node is shut down".to_string())
}

fn storage_failure(e: StorageError) -> (StatusCode, String) {
    warn!(error = %e, "failed to persist before replying");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn handle_request_vote(
    State(core): State<SharedCore>,
    Json(args): Json<RequestVoteArgs>,
) -> RpcResult<RequestVoteResult> {
    let mut core = core.lock().await;
    if core.is_killed() {
        return Err(shut_down());
    }
    core.handle_request_vote(&args).map(Json).map_err(storage_failure)
}

async fn handle_append_entries(
    State(core): State<SharedCore>,
    Json(args): Json<AppendEntriesArgs>,
) -> RpcResult<AppendEntriesResult> {
    let mut core = core.lock().await;
    if core.is_killed() {
        return Err(shut_down());
    }
    core.handle_append_entries(&args)
        .map(|output| Json(output.result))
        .map_err(storage_failure)
}

async fn handle_install_snapshot(
    State(core): State<SharedCore>,
    Json(args): Json<InstallSnapshotArgs>,
) -> RpcResult<InstallSnapshotResult> {
    let mut core = core.lock().await;
    if core.is_killed() {
        return Err(shut_down());
    }
    core.handle_install_snapshot(&args).map(Json).map_err(storage_failure)
}
