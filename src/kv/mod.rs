//! Replicated student-record service
//!
//! - `command`: the `Op` carried through the log
//! - `server`: `KvServer`, the apply loop and the write/wait path
//! - `client`: `Clerk`, leader discovery and retries

pub mod client;
pub mod command;
pub mod server;

pub use client::{Clerk, ClientError, KvService};
pub use command::{ClientId, Op, OpKind};
pub use server::{KvError, KvServer, KvStatus};
