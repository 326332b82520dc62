//! State machine abstraction for the replicated service
//!
//! The state machine is the application logic that Raft coordinates.
//! When log entries are committed, they are applied to the state machine.

use thiserror::Error;

use super::kv::StudentRecord;
use crate::kv::command::Op;

/// Result of applying one committed operation
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Operation took effect; carries the value a read observed
    Applied(Option<StudentRecord>),
    /// Write already applied for this client and sequence; state unchanged
    Duplicate,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("snapshot deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// State machine trait - the application logic that Raft coordinates
///
/// Implementations must be deterministic: applying the same operations
/// in the same order must produce the same state on all nodes.
pub trait StateMachine: Send {
    fn apply(&mut self, op: &Op) -> ApplyOutcome;
}

/// Snapshotable state machine - supports log compaction
///
/// A snapshot must capture everything `apply` depends on, including the
/// duplicate-detection table.
pub trait Snapshotable: StateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, SnapshotError>;

    /// Replaces current state with the deserialized snapshot data
    fn restore(&mut self, data: &[u8]) -> Result<(), SnapshotError>;
}
