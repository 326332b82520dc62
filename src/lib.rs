//! Replicated student-record store on a Raft consensus engine
//!
//! Nodes agree on one ordered log of operations through Raft (`core`) and
//! apply it to identical record stores (`state_machine`). The `kv` layer ties
//! the two together and serves clients; `api` puts it on HTTP.

pub mod api;
pub mod core;
pub mod kv;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
