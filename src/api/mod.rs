//! HTTP surfaces
//!
//! - `kv_http`: client RPCs served by each node, and `HttpKvService` to call them
//! - `gateway`: REST endpoints for browsers, backed by a `Clerk`

pub mod gateway;
pub mod kv_http;
