//! Storage abstraction for Raft persistent state
//!
//! - `MemoryStorage`: Fast, in-memory storage for testing; clones share state
//!   so a test can restart a node over the same durable state
//! - `FileStorage`: File-based storage with CRC32 checksums

pub mod file;
pub mod memory;
pub mod traits;

pub use traits::{Storage, StorageError};
