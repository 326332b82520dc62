//! REST gateway binary
//!
//! Serves /put, /get, /search and /list_all in front of a running cluster.
//!
//! Example:
//!   raftkv-gateway --listen 0.0.0.0:8080 --nodes 127.0.0.1:9001,127.0.0.1:9002,127.0.0.1:9003

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raftkv::api::gateway::create_gateway_router;
use raftkv::api::kv_http::HttpKvService;
use raftkv::core::config::ClientConfig;
use raftkv::kv::client::Clerk;

#[derive(Debug, Parser)]
#[command(name = "raftkv-gateway", about = "REST gateway for a replicated student-record store")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Client API addresses of every cluster node, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Per-request HTTP timeout; keep it above the nodes' apply timeout
    #[arg(long, default_value_t = 2000)]
    request_timeout_ms: u64,

    #[arg(long, default_value_t = 5)]
    max_attempts: usize,

    #[arg(long, default_value_t = 100)]
    retry_backoff_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("raftkv=info")))
        .init();

    let args = Args::parse();
    let timeout = Duration::from_millis(args.request_timeout_ms);
    let services = args
        .nodes
        .iter()
        .map(|addr| HttpKvService::new(addr.clone(), timeout))
        .collect::<reqwest::Result<Vec<_>>>()
        .context("building http client")?;
    let config = ClientConfig::default()
        .with_max_attempts(args.max_attempts)
        .with_retry_backoff(Duration::from_millis(args.retry_backoff_ms));
    let clerk = Clerk::new(services, config);
    info!(client_id = clerk.client_id(), nodes = ?args.nodes, "gateway client ready");

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(addr = %args.listen, "gateway listening");
    axum::serve(listener, create_gateway_router(Arc::new(clerk)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server failed")?;
    Ok(())
}
