//! Encoding of the consensus state handed to `Storage`
//!
//! Every blob starts with a one-byte format version followed by a bincode
//! body. The consensus state and the snapshot carry independent versions.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::raft_core::LogEntry;
use crate::storage::StorageError;

/// Format version of the encoded consensus state blob
pub const RAFT_STATE_FORMAT_VERSION: u8 = 1;

/// Everything a node must remember across restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    /// Entries after the snapshot, in index order
    pub log: Vec<LogEntry>,
    pub snapshot_last_index: u64,
    pub snapshot_last_term: u64,
}

impl PersistentState {
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        encode_versioned(RAFT_STATE_FORMAT_VERSION, self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let state: PersistentState = decode_versioned(RAFT_STATE_FORMAT_VERSION, bytes, "raft state")?;
        state.check_contiguous()?;
        Ok(state)
    }

    /// Log indexes must run without gaps from the snapshot boundary
    fn check_contiguous(&self) -> Result<(), StorageError> {
        for (offset, entry) in self.log.iter().enumerate() {
            let expected = self.snapshot_last_index + 1 + offset as u64;
            if entry.index != expected {
                return Err(StorageError::Corruption(format!(
                    "log entry at position {} has index {}, expected {}",
                    offset, entry.index, expected
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn encode_versioned<T: Serialize>(version: u8, value: &T) -> Result<Vec<u8>, StorageError> {
    let body = bincode::serialize(value).map_err(|e| StorageError::Encoding(e.to_string()))?;
    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(version);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

pub(crate) fn decode_versioned<T: DeserializeOwned>(
    expected: u8,
    bytes: &[u8],
    what: &str,
) -> Result<T, StorageError> {
    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| StorageError::Corruption(format!("empty {} blob", what)))?;
    if *version != expected {
        return Err(StorageError::Corruption(format!(
            "unsupported {} format version {} (expected {})",
            what, version, expected
        )));
    }
    bincode::deserialize(body).map_err(|e| StorageError::Corruption(format!("invalid {}: {}", what, e)))
}
