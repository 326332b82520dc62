//! File-based storage implementation for Raft persistent state
//!
//! Stores two blobs within a directory:
//! - `raft_state` - Encoded consensus state (term, vote, log)
//! - `snapshot` - Most recent encoded state machine snapshot
//!
//! Each file is `[crc32 (4 bytes, little endian)][payload]` and is replaced
//! atomically (write to temp, fsync, rename, fsync the directory), so a
//! crash leaves either the old or the new blob. The checksum catches torn
//! or bit-rotted files.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Storage, StorageError};

const CHECKSUM_LEN: usize = 4;

/// File-based storage implementation
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Create a new FileStorage in the given directory
    /// Creates the directory if it doesn't exist
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(FileStorage { dir })
    }

    fn raft_state_path(&self) -> PathBuf {
        self.dir.join("raft_state")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot")
    }

    /// Atomically replace `path` with the checksummed payload
    fn write_blob(&self, path: &Path, payload: &[u8]) -> Result<(), StorageError> {
        let temp_path = path.with_extension("tmp");
        let checksum = crc32fast::hash(payload);

        let mut file = File::create(&temp_path)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.write_all(payload)?;
        file.sync_all()?;

        fs::rename(&temp_path, path)?;
        self.sync_dir()?;
        debug!(path = %path.display(), bytes = payload.len(), "wrote blob");
        Ok(())
    }

    /// Flush the directory entry so a completed rename survives power loss
    fn sync_dir(&self) -> Result<(), StorageError> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    /// Read and verify a blob, None if the file does not exist
    fn read_blob(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read(path)?;
        if content.len() < CHECKSUM_LEN {
            return Err(StorageError::Corruption(format!(
                "{:?} is too short to hold a checksum",
                path
            )));
        }

        let (checksum_bytes, payload) = content.split_at(CHECKSUM_LEN);
        let mut stored = [0u8; CHECKSUM_LEN];
        stored.copy_from_slice(checksum_bytes);
        let stored_checksum = u32::from_le_bytes(stored);
        let computed_checksum = crc32fast::hash(payload);

        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch in {:?}: stored {:08x}, computed {:08x}",
                path, stored_checksum, computed_checksum
            )));
        }

        Ok(Some(payload.to_vec()))
    }
}

impl Storage for FileStorage {
    fn load_raft_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_blob(&self.raft_state_path())
    }

    fn save_raft_state(&mut self, state: &[u8]) -> Result<(), StorageError> {
        self.write_blob(&self.raft_state_path(), state)
    }

    fn load_snapshot(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_blob(&self.snapshot_path())
    }

    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8]) -> Result<(), StorageError> {
        self.write_blob(&self.snapshot_path(), snapshot)?;
        self.write_blob(&self.raft_state_path(), state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persist::PersistentState;
    use crate::core::raft_core::{LogEntry, Payload};
    use tempfile::TempDir;

    fn test_storage() -> (FileStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        (storage, dir)
    }

    #[test]
    fn test_fresh_storage_is_empty() {
        let (storage, _dir) = test_storage();
        assert_eq!(storage.load_raft_state().unwrap(), None);
        assert_eq!(storage.load_snapshot().unwrap(), None);
    }

    #[test]
    fn test_save_replaces_previous_state() {
        let (mut storage, _dir) = test_storage();

        storage.save_raft_state(b"first").unwrap();
        storage.save_raft_state(b"second").unwrap();

        assert_eq!(storage.load_raft_state().unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_persistence_across_instances() {
        let dir = TempDir::new().unwrap();
        let state = PersistentState {
            current_term: 42,
            voted_for: Some(7),
            log: vec![LogEntry {
                term: 42,
                index: 1,
                payload: Payload::Command(b"HELLO".to_vec()),
            }],
            snapshot_last_index: 0,
            snapshot_last_term: 0,
        };

        // First instance - write data
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_raft_state(&state.encode().unwrap()).unwrap();
        }

        // Second instance - read data (simulates restart)
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            let bytes = storage.load_raft_state().unwrap().unwrap();
            assert_eq!(PersistentState::decode(&bytes).unwrap(), state);
        }
    }

    #[test]
    fn test_state_and_snapshot_saved_together() {
        let (mut storage, _dir) = test_storage();

        storage.save_state_and_snapshot(b"state", b"snapshot").unwrap();

        assert_eq!(storage.load_raft_state().unwrap(), Some(b"state".to_vec()));
        assert_eq!(storage.load_snapshot().unwrap(), Some(b"snapshot".to_vec()));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let (mut storage, dir) = test_storage();
        storage.save_raft_state(b"state").unwrap();
        assert!(!dir.path().join("raft_state.tmp").exists());
    }

    #[test]
    fn test_directory_sync_fails_once_directory_is_gone() {
        let (mut storage, dir) = test_storage();
        storage.save_raft_state(b"state").unwrap();
        assert!(storage.sync_dir().is_ok());

        fs::remove_dir_all(dir.path()).unwrap();
        assert!(matches!(storage.sync_dir(), Err(StorageError::Io(_))));
    }

    #[test]
    fn test_detects_corrupted_state() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_raft_state(b"term 42").unwrap();

        // Flip a payload byte but keep the stored checksum
        let path = dir.path().join("raft_state");
        let mut content = fs::read(&path).unwrap();
        let last = content.len() - 1;
        content[last] ^= 0xff;
        fs::write(&path, content).unwrap();

        let result = storage.load_raft_state();
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_detects_truncated_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_state_and_snapshot(b"state", b"snapshot").unwrap();
        fs::write(dir.path().join("snapshot"), [1u8, 2]).unwrap();

        let result = storage.load_snapshot();
        assert!(matches!(result, Err(StorageError::Corruption(_))));
    }
}
