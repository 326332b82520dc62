//! Operations carried through the log
//!
//! An `Op` is encoded with bincode into a `Payload::Command`. The client
//! identity and sequence number travel with every operation so the state
//! machine can drop retransmitted writes and the submitting server can tell
//! its own entry from one a newer leader placed at the same index.

use serde::{Deserialize, Serialize};

use crate::state_machine::kv::StudentRecord;

/// Identity of a client session, chosen at random by the client
pub type ClientId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    Get { key: String },
    Put { key: String, record: StudentRecord },
}

/// A client operation as it appears in the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub client_id: ClientId,
    pub seq: u64,
}

impl Op {
    pub fn get(key: impl Into<String>, client_id: ClientId, seq: u64) -> Self {
        Op {
            kind: OpKind::Get { key: key.into() },
            client_id,
            seq,
        }
    }

    pub fn put(key: impl Into<String>, record: StudentRecord, client_id: ClientId, seq: u64) -> Self {
        Op {
            kind: OpKind::Put {
                key: key.into(),
                record,
            },
            client_id,
            seq,
        }
    }

    pub fn key(&self) -> &str {
        match &self.kind {
            OpKind::Get { key } | OpKind::Put { key, .. } => key,
        }
    }

    /// Whether `other` is the same submission (same client and sequence)
    ///
    /// The content is not compared. A waiter only sees the entry at the index
    /// it was given by `start`, and only when that entry carries the term it
    /// was placed in, so a matching (client_id, seq) there is its own entry.
    pub fn same_submission(&self, other: &Op) -> bool {
        self.client_id == other.client_id && self.seq == other.seq
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
