//! State machine layer
//!
//! - `KeyValueStore`: student records keyed by id, with per-client
//!   duplicate detection

pub mod kv;
pub mod traits;

pub use kv::{KeyValueStore, StudentRecord};
pub use traits::{ApplyOutcome, SnapshotError, Snapshotable, StateMachine};
