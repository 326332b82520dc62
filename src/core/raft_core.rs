//! Raft Consensus Algorithm Implementation
//!
//! This module implements the Raft consensus protocol as described in:
//! "In Search of an Understandable Consensus Algorithm" by Diego Ongaro and John Ousterhout
//!
//! `RaftCore` is synchronous and transport-agnostic. Every handler that
//! changes persistent state writes it to `Storage` before returning the reply,
//! and committed entries leave through the `ApplyMsg` channel in index order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::persist::PersistentState;
use super::snapshot::{Snapshot, SnapshotMetadata};
use crate::storage::{Storage, StorageError};

/// Identity of a cluster member
pub type NodeId = u64;

/// Upper bound on entries carried by a single AppendEntries
pub const MAX_ENTRIES_PER_APPEND: usize = 128;

/// Raft node states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Follower: Passive state, receives updates from leader
    Follower,
    /// Candidate: Actively seeking votes to become leader
    Candidate,
    /// Leader: Handles all client requests and replicates log
    Leader,
}

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Appended by a new leader so entries from previous terms commit indirectly
    Noop,
    /// Opaque command for the replicated state machine
    Command(Vec<u8>),
}

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when entry was received by leader
    pub term: u64,
    /// Index in the log (1-indexed)
    pub index: u64,
    pub payload: Payload,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting vote
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry
    pub last_log_index: u64,
    /// Term of candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Current term, for candidate to update itself
    pub term: u64,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: u64,
    /// Term of prev_log_index entry
    pub prev_log_term: u64,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit_index
    pub leader_commit: u64,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Current term, for leader to update itself
    pub term: u64,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
    /// On rejection: first index the leader should consider resending from
    #[serde(default)]
    pub conflict_index: Option<u64>,
    /// On rejection: term of the follower's entry at prev_log_index, if it had one
    #[serde(default)]
    pub conflict_term: Option<u64>,
}

/// Result of handling an AppendEntries RPC
#[derive(Debug, Clone)]
pub struct HandleAppendEntriesOutput {
    /// The response to send back to the leader
    pub result: AppendEntriesResult,
    /// Leader ID if we recognized a valid leader
    pub leader_id: Option<NodeId>,
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: NodeId,
    /// Last log index included in snapshot
    pub last_included_index: u64,
    /// Term of last included entry
    pub last_included_term: u64,
    /// Snapshot data
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstallSnapshotResult {
    /// Follower now holds everything up to the snapshot index
    Success { term: u64 },
    /// Snapshot was refused
    Failed { term: u64, reason: String },
}

/// Item on the committed-command stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// Next committed entry, in strictly increasing index order
    Entry(LogEntry),
    /// Replace the state machine with this snapshot
    Snapshot(Snapshot),
}

/// What the leader sent in an AppendEntries, kept to interpret the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendSent {
    pub term: u64,
    pub prev_log_index: u64,
    /// Index of the last entry carried (prev_log_index for a heartbeat)
    pub last_index: u64,
}

impl AppendSent {
    pub fn of(args: &AppendEntriesArgs) -> Self {
        AppendSent {
            term: args.term,
            prev_log_index: args.prev_log_index,
            last_index: args.prev_log_index + args.entries.len() as u64,
        }
    }
}

/// Request the leader owes a peer
#[derive(Debug, Clone)]
pub enum PeerRequest {
    Append(AppendEntriesArgs),
    Snapshot(InstallSnapshotArgs),
}

/// Point-in-time view of a node for status endpoints and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: NodeId,
    pub state: RaftState,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_last_index: u64,
}

/// Core Raft state machine (sync, transport-agnostic)
pub struct RaftCore {
    // Storage backend for persistent state
    storage: Box<dyn Storage>,
    // Committed-command stream; None once killed or the consumer went away
    apply_tx: Option<UnboundedSender<ApplyMsg>>,

    // Persistent state on all servers (updated on stable storage before responding to RPCs)
    /// Latest term server has seen (initialized to 0 on first boot, increases monotonically)
    pub current_term: u64,
    /// Candidate ID that received vote in current term (or None if none)
    pub voted_for: Option<NodeId>,
    /// Entries after the snapshot; log[0] has index snapshot_last_index + 1
    pub log: Vec<LogEntry>,
    /// Last log index included in snapshot (0 if no snapshot)
    pub snapshot_last_index: u64,
    /// Term of the last log entry included in snapshot (0 if no snapshot)
    pub snapshot_last_term: u64,

    // Volatile state on all servers
    /// Index of highest log entry known to be committed (initialized to 0, increases monotonically)
    pub commit_index: u64,
    /// Index of highest log entry handed to the apply channel
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    /// For each server, index of next log entry to send to that server (initialized to leader last log index + 1)
    pub next_index: HashMap<NodeId, u64>,
    /// For each server, index of highest log entry known to be replicated on server (initialized to 0, increases monotonically)
    pub match_index: HashMap<NodeId, u64>,

    // Node-specific state
    /// Unique identifier for this node
    pub id: NodeId,
    /// Current state of this node
    pub state: RaftState,
    /// IDs of other nodes in the cluster
    pub peers: Vec<NodeId>,
    /// Peers that have granted votes in the current election (used by candidates)
    votes_received: Vec<NodeId>,
    /// Current known leader (updated when receiving valid AppendEntries)
    pub current_leader: Option<NodeId>,
    /// Last time we heard from a valid leader or granted a vote (for election timeout)
    pub last_heartbeat: Instant,
    killed: bool,
}

impl RaftCore {
    /// Create a new Raft core over the given storage backend
    ///
    /// Loads persistent state and the latest snapshot. If a snapshot exists it
    /// is the first message on `apply_tx`, so the state machine starts from it.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: Box<dyn Storage>,
        apply_tx: UnboundedSender<ApplyMsg>,
    ) -> Result<Self, StorageError> {
        let state = match storage.load_raft_state()? {
            Some(bytes) => PersistentState::decode(&bytes)?,
            None => PersistentState::default(),
        };
        let snapshot = match storage.load_snapshot()? {
            Some(bytes) => Some(Snapshot::decode(&bytes)?),
            None => None,
        };

        let mut core = RaftCore {
            storage,
            apply_tx: Some(apply_tx),
            current_term: state.current_term,
            voted_for: state.voted_for,
            log: state.log,
            snapshot_last_index: state.snapshot_last_index,
            snapshot_last_term: state.snapshot_last_term,
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            state: RaftState::Follower,
            peers,
            votes_received: Vec::new(),
            current_leader: None,
            last_heartbeat: Instant::now(),
            killed: false,
        };

        match snapshot {
            Some(snapshot) => {
                let index = snapshot.metadata.last_included_index;
                if index < core.snapshot_last_index {
                    return Err(StorageError::Corruption(format!(
                        "snapshot at {} is older than the log boundary {}",
                        index, core.snapshot_last_index
                    )));
                }
                if index > core.snapshot_last_index {
                    // Crashed between writing the snapshot and the state
                    warn!(node = id, index, "state predates snapshot, compacting on load");
                    core.compact_to(index, snapshot.metadata.last_included_term);
                    core.persist()?;
                }
                core.commit_index = index;
                core.last_applied = index;
                core.send_apply(ApplyMsg::Snapshot(snapshot));
            }
            None if core.snapshot_last_index > 0 => {
                return Err(StorageError::Corruption(format!(
                    "log starts after index {} but no snapshot was found",
                    core.snapshot_last_index
                )));
            }
            None => {}
        }

        info!(
            node = id,
            term = core.current_term,
            last_index = core.last_log_index(),
            snapshot_index = core.snapshot_last_index,
            "raft core loaded"
        );
        Ok(core)
    }

    // === Persistence helpers ===

    fn persistent_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.clone(),
            snapshot_last_index: self.snapshot_last_index,
            snapshot_last_term: self.snapshot_last_term,
        }
    }

    fn persist(&mut self) -> Result<(), StorageError> {
        let bytes = self.persistent_state().encode()?;
        self.storage.save_raft_state(&bytes)
    }

    fn persist_with_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let state = self.persistent_state().encode()?;
        self.storage.save_state_and_snapshot(&state, &snapshot.encode()?)
    }

    /// Load the current snapshot from storage
    /// Returns None if no snapshot exists
    pub fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.storage.load_snapshot()? {
            Some(bytes) => Ok(Some(Snapshot::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    // === Log helpers ===

    /// Get the last log index (returns snapshot_last_index if log is empty)
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map_or(self.snapshot_last_index, |e| e.index)
    }

    /// Get the term of the last log entry (returns snapshot_last_term if log is empty)
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map_or(self.snapshot_last_term, |e| e.term)
    }

    /// Get a log entry by its index, accounting for snapshot offset
    /// Returns None if the entry is in the snapshot or beyond the log
    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_last_index {
            return None;
        }
        let offset = (index - self.snapshot_last_index - 1) as usize;
        self.log.get(offset)
    }

    /// Term of the entry at `index`; None if compacted away or beyond the log
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            Some(0)
        } else if index == self.snapshot_last_index {
            Some(self.snapshot_last_term)
        } else {
            self.entry(index).map(|e| e.term)
        }
    }

    /// Check if candidate's log is at least as up-to-date as receiver's log
    /// Returns true if:
    /// - candidate's last log term > receiver's last log term, OR
    /// - candidate's last log term == receiver's last log term AND candidate's last log index >= receiver's last log index
    pub fn is_log_up_to_date(&self, candidate_last_log_term: u64, candidate_last_log_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        candidate_last_log_term > my_last_term
            || (candidate_last_log_term == my_last_term && candidate_last_log_index >= my_last_index)
    }

    /// Drop everything up to and including `index`, keeping a suffix that agrees with it
    fn compact_to(&mut self, index: u64, term: u64) {
        if index <= self.last_log_index() && self.term_at(index) == Some(term) {
            self.log.retain(|e| e.index > index);
        } else {
            self.log.clear();
        }
        self.snapshot_last_index = index;
        self.snapshot_last_term = term;
    }

    fn first_index_of_term(&self, index: u64, term: u64) -> u64 {
        let mut first = index;
        while first - 1 > self.snapshot_last_index && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
            .or_else(|| {
                (self.snapshot_last_index > 0 && self.snapshot_last_term == term)
                    .then_some(self.snapshot_last_index)
            })
    }

    /// Votes (or matches) needed for a strict majority, counting this node
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Adopt a higher term and revert to follower
    fn step_down(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.current_leader = None;
        }
        if self.state != RaftState::Follower {
            info!(node = self.id, term, was = ?self.state, "stepped down to follower");
            self.state = RaftState::Follower;
        }
        self.votes_received.clear();
    }

    // === RPC handlers ===

    /// Handle RequestVote RPC
    pub fn handle_request_vote(&mut self, vote_req: &RequestVoteArgs) -> Result<RequestVoteResult, StorageError> {
        let mut dirty = false;

        // If RPC request or response contains term T > currentTerm: set currentTerm = T, convert to follower
        if vote_req.term > self.current_term {
            self.step_down(vote_req.term);
            dirty = true;
        }

        let vote_granted = vote_req.term == self.current_term
            && self.voted_for.map_or(true, |v| v == vote_req.candidate_id)
            && self.is_log_up_to_date(vote_req.last_log_term, vote_req.last_log_index);

        if vote_granted {
            if self.voted_for != Some(vote_req.candidate_id) {
                self.voted_for = Some(vote_req.candidate_id);
                dirty = true;
            }
            // Granting a vote defers our own candidacy
            self.last_heartbeat = Instant::now();
            debug!(node = self.id, term = self.current_term, candidate = vote_req.candidate_id, "granted vote");
        }

        if dirty {
            self.persist()?;
        }

        Ok(RequestVoteResult {
            term: self.current_term,
            vote_granted,
        })
    }

    /// Handle AppendEntries RPC (heartbeat or log replication)
    /// Returns the result to send back and the leader ID if recognized
    pub fn handle_append_entries(
        &mut self,
        append_req: &AppendEntriesArgs,
    ) -> Result<HandleAppendEntriesOutput, StorageError> {
        let mut dirty = false;

        if append_req.term > self.current_term {
            self.step_down(append_req.term);
            dirty = true;
        }

        if append_req.term < self.current_term {
            if dirty {
                self.persist()?;
            }
            return Ok(HandleAppendEntriesOutput {
                result: self.reject(None, None),
                leader_id: None,
            });
        }

        // Valid AppendEntries from current leader - reset election timeout
        if self.state != RaftState::Follower {
            self.step_down(append_req.term);
        }
        self.current_leader = Some(append_req.leader_id);
        self.last_heartbeat = Instant::now();
        let leader_id = Some(append_req.leader_id);

        let last_index = self.last_log_index();
        if append_req.prev_log_index > last_index {
            if dirty {
                self.persist()?;
            }
            return Ok(HandleAppendEntriesOutput {
                result: self.reject(Some(last_index + 1), None),
                leader_id,
            });
        }

        // Below the snapshot the prefix is committed, so it matches by definition
        if let Some(term) = self.term_at(append_req.prev_log_index) {
            if term != append_req.prev_log_term {
                if dirty {
                    self.persist()?;
                }
                let first = self.first_index_of_term(append_req.prev_log_index, term);
                return Ok(HandleAppendEntriesOutput {
                    result: self.reject(Some(first), Some(term)),
                    leader_id,
                });
            }
        }

        for entry in &append_req.entries {
            if entry.index <= self.snapshot_last_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    // Conflict: delete this entry and all that follow
                    let pos = (entry.index - self.snapshot_last_index - 1) as usize;
                    debug!(node = self.id, from = entry.index, dropped = self.log.len() - pos, "truncating conflicting suffix");
                    self.log.truncate(pos);
                    self.log.push(entry.clone());
                }
                None => self.log.push(entry.clone()),
            }
            dirty = true;
        }

        if dirty {
            self.persist()?;
        }

        // If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        let last_new_index = append_req.prev_log_index + append_req.entries.len() as u64;
        let new_commit = append_req.leader_commit.min(last_new_index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed();
        }

        Ok(HandleAppendEntriesOutput {
            result: AppendEntriesResult {
                term: self.current_term,
                success: true,
                conflict_index: None,
                conflict_term: None,
            },
            leader_id,
        })
    }

    fn reject(&self, conflict_index: Option<u64>, conflict_term: Option<u64>) -> AppendEntriesResult {
        AppendEntriesResult {
            term: self.current_term,
            success: false,
            conflict_index,
            conflict_term,
        }
    }

    /// Handle InstallSnapshot RPC
    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs) -> Result<InstallSnapshotResult, StorageError> {
        // Reply immediately if term < currentTerm
        if args.term < self.current_term {
            return Ok(InstallSnapshotResult::Failed {
                term: self.current_term,
                reason: "stale term".to_string(),
            });
        }

        let mut dirty = false;
        if args.term > self.current_term || self.state != RaftState::Follower {
            dirty = args.term > self.current_term;
            self.step_down(args.term);
        }

        // Reset election timeout - we heard from valid leader
        self.last_heartbeat = Instant::now();
        self.current_leader = Some(args.leader_id);

        // Everything up to our commit index already matches the leader
        if args.last_included_index <= self.commit_index {
            if dirty {
                self.persist()?;
            }
            return Ok(InstallSnapshotResult::Success {
                term: self.current_term,
            });
        }

        self.compact_to(args.last_included_index, args.last_included_term);
        self.commit_index = args.last_included_index;
        self.last_applied = args.last_included_index;

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: args.last_included_index,
                last_included_term: args.last_included_term,
            },
            data: args.data.clone(),
        };
        self.persist_with_snapshot(&snapshot)?;

        info!(
            node = self.id,
            index = args.last_included_index,
            term = args.last_included_term,
            "installed snapshot from leader {}",
            args.leader_id
        );
        self.send_apply(ApplyMsg::Snapshot(snapshot));

        Ok(InstallSnapshotResult::Success {
            term: self.current_term,
        })
    }

    // === Elections ===

    /// Start a new election (called when election timeout elapses)
    /// A single-node cluster wins immediately
    pub fn start_election(&mut self) -> Result<(), StorageError> {
        self.current_term += 1;
        self.state = RaftState::Candidate;
        self.current_leader = None;
        self.voted_for = Some(self.id);
        self.votes_received.clear();
        self.votes_received.push(self.id);
        // Reset election timer so we don't immediately timeout again
        self.last_heartbeat = Instant::now();
        info!(node = self.id, term = self.current_term, "became candidate");

        self.persist()?;

        if self.votes_received.len() >= self.majority() {
            self.become_leader()?;
        }
        Ok(())
    }

    /// Handle a RequestVote result (called by candidate after receiving vote response)
    /// Returns true if this node became leader as a result
    pub fn handle_request_vote_result(&mut self, peer_id: NodeId, result: &RequestVoteResult) -> Result<bool, StorageError> {
        if result.term > self.current_term {
            self.step_down(result.term);
            self.persist()?;
            return Ok(false);
        }

        // Grants from an earlier election carry that election's term
        if self.state != RaftState::Candidate || result.term != self.current_term || !result.vote_granted {
            return Ok(false);
        }

        if !self.votes_received.contains(&peer_id) {
            self.votes_received.push(peer_id);
        }

        if self.votes_received.len() >= self.majority() {
            self.become_leader()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Become leader (called after receiving majority of votes)
    pub fn become_leader(&mut self) -> Result<(), StorageError> {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        self.last_heartbeat = Instant::now();
        info!(node = self.id, term = self.current_term, "became leader");

        // next_index points at the no-op so it goes out with the first heartbeat
        let last_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in &self.peers {
            self.next_index.insert(peer_id, last_index + 1);
            self.match_index.insert(peer_id, 0);
        }

        self.log.push(LogEntry {
            term: self.current_term,
            index: last_index + 1,
            payload: Payload::Noop,
        });
        self.persist()?;
        self.advance_commit_index();
        Ok(())
    }

    // === Leader operations ===

    /// Add a new log entry (called by leader when receiving client request)
    /// Returns None if called on a non-leader node
    pub fn append_log_entry(&mut self, command: Vec<u8>) -> Result<Option<LogEntry>, StorageError> {
        if self.state != RaftState::Leader || self.killed {
            return Ok(None);
        }

        let entry = LogEntry {
            term: self.current_term,
            index: self.last_log_index() + 1,
            payload: Payload::Command(command),
        };
        self.log.push(entry.clone());
        if let Err(e) = self.persist() {
            self.log.pop();
            return Err(e);
        }
        debug!(node = self.id, index = entry.index, term = entry.term, "appended entry");

        // A single-node cluster commits on append
        self.advance_commit_index();
        Ok(Some(entry))
    }

    /// Submit a command; returns the (index, term) it was assigned, or None if not leader
    pub fn start(&mut self, command: Vec<u8>) -> Result<Option<(u64, u64)>, StorageError> {
        Ok(self.append_log_entry(command)?.map(|e| (e.index, e.term)))
    }

    /// Build the request each peer needs next
    pub fn replication_requests(&self) -> Vec<(NodeId, PeerRequest)> {
        self.peers
            .iter()
            .filter_map(|&peer_id| self.replication_request(peer_id).map(|r| (peer_id, r)))
            .collect()
    }

    /// AppendEntries from next_index, or InstallSnapshot when the peer is behind the compacted prefix
    pub fn replication_request(&self, peer_id: NodeId) -> Option<PeerRequest> {
        if self.state != RaftState::Leader {
            return None;
        }
        let next_idx = self
            .next_index
            .get(&peer_id)
            .copied()
            .unwrap_or(self.last_log_index() + 1);

        if next_idx <= self.snapshot_last_index {
            return match self.load_snapshot() {
                Ok(Some(snapshot)) => Some(PeerRequest::Snapshot(InstallSnapshotArgs {
                    term: self.current_term,
                    leader_id: self.id,
                    last_included_index: snapshot.metadata.last_included_index,
                    last_included_term: snapshot.metadata.last_included_term,
                    data: snapshot.data,
                })),
                Ok(None) => None,
                Err(e) => {
                    warn!(node = self.id, peer = peer_id, error = %e, "failed to load snapshot for peer");
                    None
                }
            };
        }

        let prev_log_index = next_idx - 1;
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(0);
        let start = (next_idx - self.snapshot_last_index - 1) as usize;
        let entries: Vec<LogEntry> = self
            .log
            .iter()
            .skip(start)
            .take(MAX_ENTRIES_PER_APPEND)
            .cloned()
            .collect();

        Some(PeerRequest::Append(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }))
    }

    /// Handle an AppendEntries result (called by leader after receiving replication response)
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: NodeId,
        sent: &AppendSent,
        result: &AppendEntriesResult,
    ) -> Result<(), StorageError> {
        if result.term > self.current_term {
            self.step_down(result.term);
            return self.persist();
        }

        if self.state != RaftState::Leader || sent.term != self.current_term {
            return Ok(());
        }

        if result.success {
            let matched = self.match_index.entry(peer_id).or_insert(0);
            if sent.last_index > *matched {
                *matched = sent.last_index;
            }
            let next = self.next_index.entry(peer_id).or_insert(1);
            if sent.last_index + 1 > *next {
                *next = sent.last_index + 1;
            }
            self.advance_commit_index();
            return Ok(());
        }

        let current_next = self.next_index.get(&peer_id).copied().unwrap_or(1);
        if current_next != sent.prev_log_index + 1 {
            // Reply to an older probe; next_index already moved
            return Ok(());
        }

        let hinted = match (result.conflict_term, result.conflict_index) {
            (Some(term), Some(index)) => self.last_index_of_term(term).map_or(index, |last| last + 1),
            (None, Some(index)) => index,
            _ => current_next.saturating_sub(1),
        };
        let new_next = hinted.min(current_next.saturating_sub(1)).max(1);
        debug!(node = self.id, peer = peer_id, from = current_next, to = new_next, "backing off next_index");
        self.next_index.insert(peer_id, new_next);
        Ok(())
    }

    /// Handle an InstallSnapshot result for a snapshot ending at `last_included_index`
    pub fn handle_install_snapshot_result(
        &mut self,
        peer_id: NodeId,
        sent_term: u64,
        last_included_index: u64,
        result: &InstallSnapshotResult,
    ) -> Result<(), StorageError> {
        let term = match result {
            InstallSnapshotResult::Success { term } | InstallSnapshotResult::Failed { term, .. } => *term,
        };
        if term > self.current_term {
            self.step_down(term);
            return self.persist();
        }

        if let InstallSnapshotResult::Success { .. } = result {
            if self.state == RaftState::Leader && sent_term == self.current_term {
                let matched = self.match_index.entry(peer_id).or_insert(0);
                *matched = (*matched).max(last_included_index);
                let next = self.next_index.entry(peer_id).or_insert(1);
                *next = (*next).max(last_included_index + 1);
                self.advance_commit_index();
            }
        }
        Ok(())
    }

    /// Commit the highest index replicated on a majority, if it is from the current term
    fn advance_commit_index(&mut self) {
        if self.state != RaftState::Leader {
            return;
        }

        let mut matched: Vec<u64> = self
            .peers
            .iter()
            .map(|p| self.match_index.get(p).copied().unwrap_or(0))
            .collect();
        matched.push(self.last_log_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.majority() - 1];
        // Raft safety: only commit entries from current term (Section 5.4.2)
        if candidate > self.commit_index && self.term_at(candidate) == Some(self.current_term) {
            debug!(node = self.id, term = self.current_term, index = candidate, "advanced commit index");
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    // === Apply path ===

    /// Push entries last_applied+1..=commit_index onto the apply channel
    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.entry(index).cloned() else {
                warn!(node = self.id, index, "committed entry missing from log");
                return;
            };
            if !self.send_apply(ApplyMsg::Entry(entry)) {
                return;
            }
            self.last_applied = index;
        }
    }

    fn send_apply(&mut self, msg: ApplyMsg) -> bool {
        let Some(tx) = &self.apply_tx else {
            return false;
        };
        if tx.send(msg).is_err() {
            debug!(node = self.id, "apply channel closed");
            self.apply_tx = None;
            return false;
        }
        true
    }

    /// Take a snapshot handed in by the state machine covering entries up to `index`
    ///
    /// Ignored if the snapshot is not newer than the current one or covers
    /// entries that have not been applied yet.
    pub fn snapshot(&mut self, index: u64, data: Vec<u8>) -> Result<(), StorageError> {
        if index <= self.snapshot_last_index || index > self.last_applied {
            debug!(
                node = self.id,
                index,
                snapshot_index = self.snapshot_last_index,
                last_applied = self.last_applied,
                "ignoring snapshot"
            );
            return Ok(());
        }

        let Some(term) = self.term_at(index) else {
            return Ok(());
        };
        self.compact_to(index, term);

        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: index,
                last_included_term: term,
            },
            data,
        };
        self.persist_with_snapshot(&snapshot)?;
        info!(node = self.id, index, term, remaining = self.log.len(), "snapshot taken");
        Ok(())
    }

    // === Lifecycle ===

    /// Stop accepting commands and close the committed-command stream
    pub fn kill(&mut self) {
        if !self.killed {
            info!(node = self.id, term = self.current_term, "raft core killed");
        }
        self.killed = true;
        self.apply_tx = None;
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            state: self.state,
            term: self.current_term,
            leader_id: self.current_leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index(),
            snapshot_last_index: self.snapshot_last_index,
        }
    }
}
