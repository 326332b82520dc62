//! Per-node HTTP surface of the replicated store
//!
//! - `POST /kv/get`, `POST /kv/put`: client RPCs, JSON bodies
//! - `GET /kv/keys`: keys held locally
//! - `GET /kv/status`: consensus and apply progress
//!
//! Service errors (`WrongLeader`, `Timeout`, `NoKey`) travel in the `err`
//! field of a 200 reply; only a node that cannot answer at all produces a
//! transport failure on the client side.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::kv::client::{ClientError, KvService};
use crate::kv::command::ClientId;
use crate::kv::server::{KvError, KvServer, KvStatus};
use crate::state_machine::StudentRecord;
use crate::transport::TransportError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: ClientId,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReply {
    pub record: Option<StudentRecord>,
    pub err: Option<KvError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutArgs {
    pub key: String,
    pub record: StudentRecord,
    pub client_id: ClientId,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutReply {
    pub err: Option<KvError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysReply {
    pub keys: Vec<String>,
    pub err: Option<KvError>,
}

/// Create an axum router serving the client RPCs of one node
pub fn create_kv_router(kv: KvServer) -> Router {
    Router::new()
        .route("/kv/get", post(handle_get))
        .route("/kv/put", post(handle_put))
        .route("/kv/keys", get(handle_keys))
        .route("/kv/status", get(handle_status))
        .with_state(kv)
}

async fn handle_get(State(kv): State<KvServer>, Json(args): Json<GetArgs>) -> Json<GetReply> {
    Json(match kv.get(&args.key, args.client_id, args.seq).await {
        Ok(record) => GetReply {
            record: Some(record),
            err: None,
        },
        Err(e) => GetReply {
            record: None,
            err: Some(e),
        },
    })
}

async fn handle_put(State(kv): State<KvServer>, Json(args): Json<PutArgs>) -> Json<PutReply> {
    let result = kv.put(&args.key, args.record, args.client_id, args.seq).await;
    Json(PutReply { err: result.err() })
}

async fn handle_keys(State(kv): State<KvServer>) -> Json<KeysReply> {
    Json(match kv.list_keys().await {
        Ok(keys) => KeysReply { keys, err: None },
        Err(e) => KeysReply {
            keys: Vec::new(),
            err: Some(e),
        },
    })
}

async fn handle_status(State(kv): State<KvServer>) -> Json<KvStatus> {
    Json(kv.status().await)
}

/// Client-side handle to one node's HTTP surface
#[derive(Clone)]
pub struct HttpKvService {
    /// Node address (e.g., "127.0.0.1:9001")
    addr: String,
    client: reqwest::Client,
}

impl HttpKvService {
    /// `timeout` must exceed the server's apply timeout or slow puts look like lost nodes
    pub fn new(addr: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpKvService {
            addr: addr.into(),
            client,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn send<R: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<R, TransportError> {
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Remote(format!("{}: {}", status, body)));
        }
        response.json::<R>().await.map_err(classify)
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
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
impl KvService for HttpKvService {
    async fn get(&self, key: &str, client_id: ClientId, seq: u64) -> Result<StudentRecord, ClientError> {
        let args = GetArgs {
            key: key.to_string(),
            client_id,
            seq,
        };
        let reply: GetReply = self.send(self.client.post(self.url("/kv/get")).json(&args)).await?;
        match (reply.record, reply.err) {
            (_, Some(e)) => Err(e.into()),
            (Some(record), None) => Ok(record),
            (None, None) => Err(KvError::NoKey.into()),
        }
    }

    async fn put(
        &self,
        key: &str,
        record: StudentRecord,
        client_id: ClientId,
        seq: u64,
    ) -> Result<(), ClientError> {
        let args = PutArgs {
            key: key.to_string(),
            record,
            client_id,
            seq,
        };
        let reply: PutReply = self.send(self.client.post(self.url("/kv/put")).json(&args)).await?;
        reply.err.map_or(Ok(()), |e| Err(e.into()))
    }

    async fn list_keys(&self) -> Result<Vec<String>, ClientError> {
        let reply: KeysReply = self.send(self.client.get(self.url("/kv/keys"))).await?;
        reply.err.map_or(Ok(reply.keys), |e| Err(e.into()))
    }
}
