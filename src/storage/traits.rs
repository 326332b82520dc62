//! Storage abstraction for Raft persistent state
//!
//! Raft requires certain state to be persisted to stable storage before
//! responding to RPCs: current_term, voted_for, and log entries. Storage
//! treats that state as an opaque blob; encoding lives in `core::persist`.

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    /// State could not be serialized
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Durable home for a node's consensus state and state machine snapshot
///
/// Implementations must ensure durability - data must survive crashes, and
/// each save replaces the previous blob atomically.
/// All operations are synchronous to simplify the RaftCore logic.
/// The `Send` bound is required for use in async contexts.
pub trait Storage: Send {
    /// Load the encoded consensus state
    /// Returns None on a fresh start
    fn load_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace the encoded consensus state
    /// Must be durable before returning
    fn save_raft_state(&mut self, state: &[u8]) -> Result<(), StorageError>;

    /// Load the most recent encoded snapshot
    /// Returns None if no snapshot has been saved
    fn load_snapshot(&self) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace both blobs
    /// The snapshot is written first, so a crash in between leaves a
    /// snapshot that is newer than the consensus state, never older.
    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8])
        -> Result<(), StorageError>;
}
