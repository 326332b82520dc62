//! KvServer - the replicated student-record service on one node
//!
//! A single apply task drains the committed-command stream in index order,
//! applies each `Op` to the `KeyValueStore`, and wakes the request waiting
//! on that index. Writes go through `RaftHandle::start` and then wait for
//! their own entry to come back out of the log.
//!
//! Lock order: the service state lock is taken before the consensus core
//! lock, never the other way round. `start` and waiter registration happen
//! under one hold of the state lock so an entry cannot be applied before
//! its waiter exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::command::{ClientId, Op};
use crate::core::config::{KvConfig, ReadMode};
use crate::core::raft_core::{ApplyMsg, LogEntry, NodeId, Payload, RaftStatus};
use crate::core::raft_server::{RaftError, RaftHandle};
use crate::core::snapshot::Snapshot;
use crate::state_machine::{ApplyOutcome, KeyValueStore, Snapshotable, StateMachine, StudentRecord};

/// Errors visible to clients of the service
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum KvError {
    /// This node cannot serve the request; try another node
    #[error("wrong leader")]
    WrongLeader,
    /// The entry was not seen applied in time; its outcome is unknown
    #[error("timed out waiting for the operation to apply")]
    Timeout,
    #[error("no such key")]
    NoKey,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Point-in-time view of the service for status endpoints and tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStatus {
    pub raft: RaftStatus,
    pub applied_index: u64,
    pub keys: usize,
}

/// What the apply task observed at a waited-on index
#[derive(Debug)]
enum Applied {
    Op { op: Op, outcome: ApplyOutcome },
    /// A leader no-op, or a payload that did not decode
    Other,
}

struct Waiter {
    term: u64,
    tx: oneshot::Sender<Applied>,
}

struct KvState {
    store: KeyValueStore,
    waiters: HashMap<u64, Waiter>,
    /// Highest log index applied to `store`
    applied_index: u64,
    /// Index covered by the last snapshot handed to consensus
    snapshot_index: u64,
}

struct Inner {
    id: NodeId,
    raft: RaftHandle,
    config: KvConfig,
    state: Mutex<KvState>,
    killed: AtomicBool,
}

/// Handle to the service running on one node
#[derive(Clone)]
pub struct KvServer {
    inner: Arc<Inner>,
}

impl KvServer {
    /// Start the service over a running Raft node and its committed-command stream
    pub fn start(raft: RaftHandle, apply_rx: UnboundedReceiver<ApplyMsg>, config: KvConfig) -> Self {
        let inner = Arc::new(Inner {
            id: raft.id(),
            raft,
            config,
            state: Mutex::new(KvState::new()),
            killed: AtomicBool::new(false),
        });
        tokio::spawn(apply_loop(inner.clone(), apply_rx));
        KvServer { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn raft(&self) -> &RaftHandle {
        &self.inner.raft
    }

    /// Read a record
    ///
    /// With `ReadMode::Local` this answers from the local map on any node and
    /// may return stale data. With `ReadMode::Log` the read is ordered through
    /// the log and only the leader answers.
    pub async fn get(&self, key: &str, client_id: ClientId, seq: u64) -> Result<StudentRecord, KvError> {
        self.check_alive()?;
        let record = match self.inner.config.read_mode {
            ReadMode::Local => self.inner.state.lock().await.store.get(key),
            ReadMode::Log => match self.submit(Op::get(key, client_id, seq)).await? {
                ApplyOutcome::Applied(record) => record,
                ApplyOutcome::Duplicate => {
                    return Err(KvError::Internal("read reported as duplicate".to_string()))
                }
            },
        };
        record.ok_or(KvError::NoKey)
    }

    /// Replace the record under `key`, waiting until the write is applied
    ///
    /// A retransmission of an already-applied (client_id, seq) succeeds
    /// without applying the write again.
    pub async fn put(
        &self,
        key: &str,
        record: StudentRecord,
        client_id: ClientId,
        seq: u64,
    ) -> Result<(), KvError> {
        self.check_alive()?;
        match self.submit(Op::put(key, record, client_id, seq)).await? {
            ApplyOutcome::Applied(_) => Ok(()),
            ApplyOutcome::Duplicate => {
                debug!(node = self.inner.id, client_id, seq, "duplicate put acknowledged");
                Ok(())
            }
        }
    }

    /// All keys held locally, subject to the same staleness as a local read
    pub async fn list_keys(&self) -> Result<Vec<String>, KvError> {
        self.check_alive()?;
        Ok(self.inner.state.lock().await.store.keys())
    }

    pub async fn status(&self) -> KvStatus {
        let (applied_index, keys) = {
            let state = self.inner.state.lock().await;
            (state.applied_index, state.store.len())
        };
        KvStatus {
            raft: self.inner.raft.status().await,
            applied_index,
            keys,
        }
    }

    /// Stop the node: consensus timers stop and pending requests fail
    pub async fn kill(&self) {
        if self.inner.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.raft.shutdown().await;
        // Abandoned waiters resolve as WrongLeader for their callers
        self.inner.state.lock().await.waiters.clear();
        info!(node = self.inner.id, "kv server killed");
    }

    pub fn is_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<(), KvError> {
        if self.is_killed() {
            Err(KvError::WrongLeader)
        } else {
            Ok(())
        }
    }

    /// Append `op` to the log and wait for the same op to be applied at its index
    async fn submit(&self, op: Op) -> Result<ApplyOutcome, KvError> {
        let command = op.encode().map_err(|e| KvError::Internal(e.to_string()))?;
        let node = self.inner.id;

        let (index, term, rx) = {
            let mut state = self.inner.state.lock().await;
            let (index, term) = self.inner.raft.start(command).await.map_err(|e| match e {
                RaftError::NotLeader { .. } | RaftError::Shutdown => KvError::WrongLeader,
                RaftError::Storage(e) => KvError::Internal(e.to_string()),
            })?;
            let rx = register_waiter(node, &mut state, index, term)?;
            (index, term, rx)
        };
        debug!(node, index, term, key = op.key(), client_id = op.client_id, seq = op.seq, "waiting for apply");

        match tokio::time::timeout(self.inner.config.apply_timeout, rx).await {
            Ok(reply) => resolve(node, index, &op, reply),
            Err(_) => {
                let mut state = self.inner.state.lock().await;
                if state.waiters.get(&index).is_some_and(|w| w.term == term) {
                    state.waiters.remove(&index);
                }
                debug!(node, index, "apply wait timed out");
                Err(KvError::Timeout)
            }
        }
    }
}

impl KvState {
    fn new() -> Self {
        KvState {
            store: KeyValueStore::new(),
            waiters: HashMap::new(),
            applied_index: 0,
            snapshot_index: 0,
        }
    }
}

/// Claim `index` for a request placed there in `term`
///
/// A waiter left over from an older term is dropped, which its caller sees as
/// `WrongLeader`. A waiter from the same or a newer term means two live
/// requests claim one index.
fn register_waiter(
    node: NodeId,
    state: &mut KvState,
    index: u64,
    term: u64,
) -> Result<oneshot::Receiver<Applied>, KvError> {
    if let Some(existing) = state.waiters.get(&index) {
        if existing.term >= term {
            error!(
                node,
                index,
                term,
                existing_term = existing.term,
                "second waiter registered for a log index"
            );
            return Err(KvError::Internal(format!(
                "log index {} already has a waiter for term {}",
                index, existing.term
            )));
        }
        debug!(node, index, old_term = existing.term, "evicting stale waiter");
    }
    let (tx, rx) = oneshot::channel();
    state.waiters.insert(index, Waiter { term, tx });
    Ok(rx)
}

/// Turn what the apply task reported at `index` into the reply for `op`
///
/// Only the submitter's own entry counts. A different op, a leader no-op, or
/// a waiter dropped unanswered all mean the entry was lost to another leader.
fn resolve(
    node: NodeId,
    index: u64,
    op: &Op,
    reply: Result<Applied, oneshot::error::RecvError>,
) -> Result<ApplyOutcome, KvError> {
    match reply {
        Ok(Applied::Op { op: applied, outcome }) if applied.same_submission(op) => Ok(outcome),
        Ok(_) => {
            debug!(node, index, "index taken by another entry");
            Err(KvError::WrongLeader)
        }
        // Sender dropped before the index was applied here
        Err(_) => Err(KvError::WrongLeader),
    }
}

async fn apply_loop(inner: Arc<Inner>, mut apply_rx: UnboundedReceiver<ApplyMsg>) {
    while let Some(msg) = apply_rx.recv().await {
        let mut state = inner.state.lock().await;
        match msg {
            ApplyMsg::Entry(entry) => {
                apply_entry(inner.id, &mut state, entry);
                maybe_snapshot(&inner, &mut state).await;
            }
            ApplyMsg::Snapshot(snapshot) => install_snapshot(&inner, &mut state, snapshot),
        }
    }

    inner.state.lock().await.waiters.clear();
    debug!(node = inner.id, "apply loop stopped");
}

fn apply_entry(node: NodeId, state: &mut KvState, entry: LogEntry) {
    if entry.index <= state.applied_index {
        return;
    }
    if entry.index != state.applied_index + 1 {
        warn!(
            node,
            index = entry.index,
            applied = state.applied_index,
            "gap in committed-command stream"
        );
    }
    state.applied_index = entry.index;

    let applied = match entry.payload {
        Payload::Noop => Applied::Other,
        Payload::Command(bytes) => match Op::decode(&bytes) {
            Ok(op) => {
                let outcome = state.store.apply(&op);
                Applied::Op { op, outcome }
            }
            Err(e) => {
                error!(node, index = entry.index, error = %e, "undecodable command in log");
                Applied::Other
            }
        },
    };

    if let Some(waiter) = state.waiters.remove(&entry.index) {
        // A different term at this index means another leader's entry won
        if waiter.term == entry.term {
            let _ = waiter.tx.send(applied);
        }
    }
}

async fn maybe_snapshot(inner: &Inner, state: &mut KvState) {
    let threshold = inner.config.snapshot_threshold;
    if threshold == 0 || state.applied_index - state.snapshot_index < threshold {
        return;
    }
    let data = match state.store.snapshot() {
        Ok(data) => data,
        Err(e) => {
            error!(node = inner.id, error = %e, "state machine snapshot failed");
            return;
        }
    };
    match inner.raft.snapshot(state.applied_index, data).await {
        Ok(()) => state.snapshot_index = state.applied_index,
        Err(e) => warn!(node = inner.id, index = state.applied_index, error = %e, "snapshot hand-off failed"),
    }
}

fn install_snapshot(inner: &Inner, state: &mut KvState, snapshot: Snapshot) {
    let index = snapshot.metadata.last_included_index;
    if index <= state.applied_index {
        return;
    }
    if let Err(e) = state.store.restore(&snapshot.data) {
        error!(node = inner.id, index, error = %e, "failed to restore snapshot");
        return;
    }
    state.applied_index = index;
    state.snapshot_index = index;
    // Entries covered by the snapshot will never be delivered individually
    state.waiters.retain(|&waited, _| waited > index);
    info!(node = inner.id, index, keys = state.store.len(), "state machine restored from snapshot");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RaftConfig;
    use crate::core::raft_core::RaftCore;
    use crate::core::raft_server::RaftServer;
    use crate::storage::memory::MemoryStorage;
    use crate::transport::inmemory::InMemoryNetwork;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn single_node(storage: MemoryStorage, config: KvConfig) -> KvServer {
        let network = InMemoryNetwork::new();
        let (tx, rx) = unbounded_channel();
        let core = RaftCore::new(1, vec![], Box::new(storage), tx).unwrap();
        let (server, shared) = RaftServer::new(core, network.transport(1), RaftConfig::default());
        network.register(1, shared);
        KvServer::start(server.start(), rx, config)
    }

    async fn wait_for_leader(kv: &KvServer) {
        for _ in 0..100 {
            if kv.raft().get_state().await.1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("node never became leader");
    }

    fn command(term: u64, index: u64, op: &Op) -> LogEntry {
        LogEntry {
            term,
            index,
            payload: Payload::Command(op.encode().unwrap()),
        }
    }

    #[test]
    fn test_second_waiter_in_same_term_is_rejected() {
        let mut state = KvState::new();
        let _first = register_waiter(1, &mut state, 5, 2).unwrap();

        let second = register_waiter(1, &mut state, 5, 2);
        assert!(matches!(second, Err(KvError::Internal(_))));
        // The original claim is untouched
        assert_eq!(state.waiters[&5].term, 2);
    }

    #[test]
    fn test_waiter_from_newer_term_is_not_replaced() {
        let mut state = KvState::new();
        let _current = register_waiter(1, &mut state, 5, 3).unwrap();

        assert!(matches!(register_waiter(1, &mut state, 5, 2), Err(KvError::Internal(_))));
        assert_eq!(state.waiters[&5].term, 3);
    }

    #[tokio::test]
    async fn test_older_term_waiter_is_evicted_as_wrong_leader() {
        let mut state = KvState::new();
        let op = Op::put("s1", StudentRecord::sample("Alice"), 9, 1);
        let stale = register_waiter(1, &mut state, 5, 1).unwrap();
        let _fresh = register_waiter(1, &mut state, 5, 2).unwrap();

        assert_eq!(state.waiters[&5].term, 2);
        assert!(matches!(resolve(1, 5, &op, stale.await), Err(KvError::WrongLeader)));
    }

    #[tokio::test]
    async fn test_own_entry_resolves_waiter() {
        let mut state = KvState::new();
        let op = Op::put("s1", StudentRecord::sample("Alice"), 9, 1);
        let rx = register_waiter(1, &mut state, 1, 4).unwrap();

        apply_entry(1, &mut state, command(4, 1, &op));

        assert!(matches!(resolve(1, 1, &op, rx.await), Ok(ApplyOutcome::Applied(_))));
        assert!(state.waiters.is_empty());
    }

    #[tokio::test]
    async fn test_entry_from_other_term_answers_wrong_leader() {
        let mut state = KvState::new();
        let op = Op::put("s1", StudentRecord::sample("Alice"), 9, 1);
        let rx = register_waiter(1, &mut state, 1, 2).unwrap();

        // Same op, but committed by the term-1 leader rather than ours
        apply_entry(1, &mut state, command(1, 1, &op));

        assert!(matches!(resolve(1, 1, &op, rx.await), Err(KvError::WrongLeader)));
        assert!(state.waiters.is_empty());
        assert_eq!(state.store.keys(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_noop_at_waited_index_answers_wrong_leader() {
        let mut state = KvState::new();
        let op = Op::put("s1", StudentRecord::sample("Alice"), 9, 1);
        let rx = register_waiter(1, &mut state, 1, 3).unwrap();

        apply_entry(
            1,
            &mut state,
            LogEntry {
                term: 3,
                index: 1,
                payload: Payload::Noop,
            },
        );

        assert!(matches!(resolve(1, 1, &op, rx.await), Err(KvError::WrongLeader)));
        assert!(state.store.is_empty());
    }

    #[tokio::test]
    async fn test_other_client_entry_answers_wrong_leader() {
        let mut state = KvState::new();
        let mine = Op::put("s1", StudentRecord::sample("Alice"), 9, 1);
        let theirs = Op::put("s1", StudentRecord::sample("Bob"), 10, 1);
        let rx = register_waiter(1, &mut state, 1, 3).unwrap();

        apply_entry(1, &mut state, command(3, 1, &theirs));

        assert!(matches!(resolve(1, 1, &mine, rx.await), Err(KvError::WrongLeader)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_then_local_get() {
        let kv = single_node(MemoryStorage::new(), KvConfig::default());
        wait_for_leader(&kv).await;

        kv.put("s1", StudentRecord::sample("Alice"), 9, 1).await.unwrap();
        assert_eq!(kv.get("s1", 9, 2).await.unwrap().name, "Alice");
        assert_eq!(kv.get("missing", 9, 3).await, Err(KvError::NoKey));
        assert_eq!(kv.list_keys().await.unwrap(), vec!["s1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_on_follower_is_wrong_leader() {
        let kv = single_node(MemoryStorage::new(), KvConfig::default());
        // No election has fired yet
        let result = kv.put("s1", StudentRecord::sample("Alice"), 9, 1).await;
        assert_eq!(result, Err(KvError::WrongLeader));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_put_applies_once() {
        let kv = single_node(MemoryStorage::new(), KvConfig::default());
        wait_for_leader(&kv).await;

        kv.put("s1", StudentRecord::sample("Alice"), 9, 1).await.unwrap();
        kv.put("s1", StudentRecord::sample("Bob"), 10, 1).await.unwrap();
        // Retransmission of the first write must not clobber the second
        kv.put("s1", StudentRecord::sample("Alice"), 9, 1).await.unwrap();

        assert_eq!(kv.get("s1", 11, 1).await.unwrap().name, "Bob");
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_read() {
        let kv = single_node(
            MemoryStorage::new(),
            KvConfig::default().with_read_mode(ReadMode::Log),
        );
        wait_for_leader(&kv).await;

        kv.put("s1", StudentRecord::sample("Alice"), 9, 1).await.unwrap();
        assert_eq!(kv.get("s1", 9, 2).await.unwrap().name, "Alice");
        assert_eq!(kv.get("nope", 9, 3).await, Err(KvError::NoKey));
    }

    #[tokio::test(start_paused = true)]
    async fn test_killed_server_rejects_requests() {
        let kv = single_node(MemoryStorage::new(), KvConfig::default());
        wait_for_leader(&kv).await;
        kv.kill().await;

        assert!(kv.is_killed());
        assert_eq!(
            kv.put("s1", StudentRecord::sample("Alice"), 9, 1).await,
            Err(KvError::WrongLeader)
        );
        assert_eq!(kv.list_keys().await, Err(KvError::WrongLeader));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_threshold_compacts_log() {
        let kv = single_node(
            MemoryStorage::new(),
            KvConfig::default().with_snapshot_threshold(5),
        );
        wait_for_leader(&kv).await;

        for seq in 1..=10 {
            kv.put(&format!("s{}", seq), StudentRecord::sample("X"), 9, seq).await.unwrap();
        }
        let status = kv.status().await;
        assert!(status.raft.snapshot_last_index >= 5);
        assert_eq!(status.keys, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_restores_from_snapshot_and_log() {
        let storage = MemoryStorage::new();
        let kv = single_node(storage.clone(), KvConfig::default().with_snapshot_threshold(4));
        wait_for_leader(&kv).await;
        for seq in 1..=6 {
            kv.put(&format!("s{}", seq), StudentRecord::sample("X"), 9, seq).await.unwrap();
        }
        kv.kill().await;

        let restarted = single_node(storage, KvConfig::default().with_snapshot_threshold(4));
        wait_for_leader(&restarted).await;
        // The restarted leader's no-op commits the tail of the log
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(restarted.list_keys().await.unwrap().len(), 6);
        // Dedup state survived too
        restarted.put("s1", StudentRecord::sample("Y"), 9, 1).await.unwrap();
        assert_eq!(restarted.get("s1", 9, 7).await.unwrap().name, "X");
    }
}
