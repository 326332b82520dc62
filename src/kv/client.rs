//! Clerk - client library for the replicated store
//!
//! Retry contract:
//! - `WrongLeader` or an unreachable node: move to the next node in the
//!   fixed membership list and retry
//! - `Timeout`: retry the same node with the same (client_id, seq)
//! - `NoKey`: not retried
//!
//! Every attempt after the first waits `retry_backoff`. After
//! `max_attempts` the operation is reported failed.
//!
//! A session keeps at most one Get or Put outstanding. The state machine only
//! remembers the highest sequence number per client, so a lower `seq` landing
//! in the log after a higher one would be acknowledged without being applied.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::command::ClientId;
use super::server::{KvError, KvServer};
use crate::core::config::ClientConfig;
use crate::state_machine::StudentRecord;
use crate::transport::TransportError;

/// Failure of a single call or of a whole operation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("no servers configured")]
    NoServers,
    #[error("gave up after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: usize, last: Box<ClientError> },
}

impl ClientError {
    /// The service-level error, if this failure carries one
    pub fn kv(&self) -> Option<&KvError> {
        match self {
            ClientError::Kv(e) => Some(e),
            ClientError::Exhausted { last, .. } => last.kv(),
            _ => None,
        }
    }
}

/// One node's client-facing RPC surface
#[async_trait]
pub trait KvService: Send + Sync {
    async fn get(&self, key: &str, client_id: ClientId, seq: u64) -> Result<StudentRecord, ClientError>;

    async fn put(
        &self,
        key: &str,
        record: StudentRecord,
        client_id: ClientId,
        seq: u64,
    ) -> Result<(), ClientError>;

    async fn list_keys(&self) -> Result<Vec<String>, ClientError>;
}

#[async_trait]
impl KvService for KvServer {
    async fn get(&self, key: &str, client_id: ClientId, seq: u64) -> Result<StudentRecord, ClientError> {
        Ok(KvServer::get(self, key, client_id, seq).await?)
    }

    async fn put(
        &self,
        key: &str,
        record: StudentRecord,
        client_id: ClientId,
        seq: u64,
    ) -> Result<(), ClientError> {
        Ok(KvServer::put(self, key, record, client_id, seq).await?)
    }

    async fn list_keys(&self) -> Result<Vec<String>, ClientError> {
        Ok(KvServer::list_keys(self).await?)
    }
}

enum Next {
    Rotate,
    Stay,
    Fail,
}

fn next_step(err: &ClientError) -> Next {
    match err {
        ClientError::Kv(KvError::WrongLeader) | ClientError::Transport(_) => Next::Rotate,
        ClientError::Kv(KvError::Timeout) => Next::Stay,
        _ => Next::Fail,
    }
}

/// Client session over a fixed list of nodes
///
/// Can be shared between tasks. Concurrent Gets and Puts queue behind each
/// other and run one at a time, each under a fresh sequence number taken in
/// queue order.
pub struct Clerk<S: KvService> {
    servers: Vec<S>,
    client_id: ClientId,
    /// Held from sequence allocation until the operation settles
    in_flight: Mutex<()>,
    seq: AtomicU64,
    leader: AtomicUsize,
    config: ClientConfig,
}

impl<S: KvService> Clerk<S> {
    pub fn new(servers: Vec<S>, config: ClientConfig) -> Self {
        Self::with_client_id(servers, rand::random(), config)
    }

    pub fn with_client_id(servers: Vec<S>, client_id: ClientId, config: ClientConfig) -> Self {
        Clerk {
            servers,
            client_id,
            in_flight: Mutex::new(()),
            seq: AtomicU64::new(0),
            leader: AtomicUsize::new(0),
            config,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Index of the node the next request goes to first
    pub fn leader_hint(&self) -> usize {
        self.leader.load(Ordering::Relaxed)
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn get(&self, key: &str) -> Result<StudentRecord, ClientError> {
        let _turn = self.in_flight.lock().await;
        let seq = self.next_seq();
        self.with_retry("get", |server| server.get(key, self.client_id, seq)).await
    }

    /// Store `record` under `key`; retries reuse the same sequence number
    pub async fn put(&self, key: &str, record: StudentRecord) -> Result<(), ClientError> {
        let _turn = self.in_flight.lock().await;
        let seq = self.next_seq();
        self.with_retry("put", |server| server.put(key, record.clone(), self.client_id, seq))
            .await
    }

    pub async fn list_keys(&self) -> Result<Vec<String>, ClientError> {
        self.with_retry("list_keys", |server| server.list_keys()).await
    }

    async fn with_retry<'a, T, F, Fut>(&'a self, op: &str, call: F) -> Result<T, ClientError>
    where
        F: Fn(&'a S) -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        if self.servers.is_empty() {
            return Err(ClientError::NoServers);
        }

        let mut last = None;
        for attempt in 1..=self.config.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
            let target = self.leader.load(Ordering::Relaxed) % self.servers.len();
            let err = match call(&self.servers[target]).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match next_step(&err) {
                Next::Rotate => {
                    let next = (target + 1) % self.servers.len();
                    debug!(client_id = self.client_id, op, from = target, to = next, error = %err, "switching server");
                    // Another task may have moved on already
                    let _ = self.leader.compare_exchange(target, next, Ordering::Relaxed, Ordering::Relaxed);
                }
                Next::Stay => {
                    debug!(client_id = self.client_id, op, server = target, attempt, "retrying after timeout")
                }
                Next::Fail => return Err(err),
            }
            last = Some(err);
        }

        let attempts = self.config.max_attempts;
        warn!(client_id = self.client_id, op, attempts, "operation failed after retries");
        Err(match last {
            Some(last) => ClientError::Exhausted {
                attempts,
                last: Box::new(last),
            },
            None => ClientError::NoServers,
        })
    }
}
