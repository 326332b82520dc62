//! In-memory storage implementation for testing
//!
//! Fast, no side effects. Clones share the same underlying blobs, which lets
//! a test "crash" a node and restart it over the state it persisted.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Storage, StorageError};

#[derive(Debug, Default)]
struct Blobs {
    raft_state: Option<Vec<u8>>,
    snapshot: Option<Vec<u8>>,
}

/// In-memory storage implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    blobs: Arc<Mutex<Blobs>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the persisted consensus state in bytes
    pub fn raft_state_size(&self) -> usize {
        self.blobs.lock().raft_state.as_ref().map_or(0, Vec::len)
    }

    /// Independent copy of the current blobs
    pub fn deep_copy(&self) -> Self {
        let blobs = self.blobs.lock();
        MemoryStorage {
            blobs: Arc::new(Mutex::new(Blobs {
                raft_state: blobs.raft_state.clone(),
                snapshot: blobs.snapshot.clone(),
            })),
        }
    }
}

impl Storage for MemoryStorage {
    fn load_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.lock().raft_state.clone())
    }

    fn save_raft_state(&mut self, state: &[u8]) -> Result<(), StorageError> {
        self.blobs.lock().raft_state = Some(state.to_vec());
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.lock().snapshot.clone())
    }

    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8]) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock();
        blobs.snapshot = Some(snapshot.to_vec());
        blobs.raft_state = Some(state.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_starts_empty() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.load_raft_state().unwrap(), None);
        assert_eq!(storage.load_snapshot().unwrap(), None);
        assert_eq!(storage.raft_state_size(), 0);
    }

    #[test]
    fn test_memory_storage_save_and_load() {
        let mut storage = MemoryStorage::new();
        storage.save_raft_state(&[1, 2, 3]).unwrap();
        assert_eq!(storage.load_raft_state().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(storage.raft_state_size(), 3);
    }

    #[test]
    fn test_clones_share_state() {
        let mut storage = MemoryStorage::new();
        let restarted = storage.clone();

        storage.save_state_and_snapshot(&[7], &[8, 9]).unwrap();

        assert_eq!(restarted.load_raft_state().unwrap(), Some(vec![7]));
        assert_eq!(restarted.load_snapshot().unwrap(), Some(vec![8, 9]));
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let mut storage = MemoryStorage::new();
        storage.save_raft_state(&[1]).unwrap();

        let copy = storage.deep_copy();
        storage.save_raft_state(&[2]).unwrap();

        assert_eq!(copy.load_raft_state().unwrap(), Some(vec![1]));
    }
}
