//! Consensus layer
//!
//! - `raft_core`: synchronous Raft state and RPC handlers
//! - `raft_node` / `raft_server`: async drivers over a `Transport`
//! - `persist` / `snapshot`: durable encodings handed to `Storage`

pub mod config;
pub mod persist;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
pub mod snapshot;

pub use config::{ClientConfig, ConfigError, KvConfig, RaftConfig, ReadMode};
pub use raft_core::{ApplyMsg, LogEntry, NodeId, Payload, RaftCore, RaftState, RaftStatus};
pub use raft_node::SharedCore;
pub use raft_server::{RaftError, RaftHandle, RaftServer};
pub use snapshot::Snapshot;
