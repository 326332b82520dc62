//! Snapshot types for log compaction
//!
//! Snapshots allow discarding old log entries by capturing
//! the state machine state at a specific log index.

use serde::{Deserialize, Serialize};

use super::persist::{decode_versioned, encode_versioned};
use crate::storage::StorageError;

/// Format version of the encoded snapshot blob
pub const SNAPSHOT_FORMAT_VERSION: u8 = 1;

/// Metadata about what's included in a snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Last log index included in this snapshot
    pub last_included_index: u64,
    /// Term of the last included log entry
    pub last_included_term: u64,
}

/// A snapshot of the state machine at a specific point in the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    /// Serialized state machine data
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        encode_versioned(SNAPSHOT_FORMAT_VERSION, self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        decode_versioned(SNAPSHOT_FORMAT_VERSION, bytes, "snapshot")
    }
}
