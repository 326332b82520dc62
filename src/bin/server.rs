//! Cluster node binary
//!
//! Runs one node with separate listeners for cluster transport and client RPCs.
//!
//! Example for a 3-node cluster:
//!   raftkv-server --id 1 --transport-port 8001 --api-port 9001 --data-dir /tmp/raftkv1 --peers 2=127.0.0.1:8002,3=127.0.0.1:8003
//!   raftkv-server --id 2 --transport-port 8002 --api-port 9002 --data-dir /tmp/raftkv2 --peers 1=127.0.0.1:8001,3=127.0.0.1:8003
//!   raftkv-server --id 3 --transport-port 8003 --api-port 9003 --data-dir /tmp/raftkv3 --peers 1=127.0.0.1:8001,2=127.0.0.1:8002
//!
//! Ports:
//!   --transport-port: Raft RPC between nodes (/raft/* endpoints)
//!   --api-port: client RPCs (/kv/* endpoints), used by the gateway

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raftkv::api::kv_http::create_kv_router;
use raftkv::core::config::{KvConfig, RaftConfig, ReadMode};
use raftkv::core::raft_core::{NodeId, RaftCore};
use raftkv::core::raft_server::RaftServer;
use raftkv::kv::server::KvServer;
use raftkv::storage::file::FileStorage;
use raftkv::transport::http::{create_raft_router, HttpTransport};

#[derive(Debug, Parser)]
#[command(name = "raftkv-server", about = "Run one node of a replicated student-record store")]
struct Args {
    /// This node's id (non-zero, unique in the cluster)
    #[arg(long)]
    id: NodeId,

    #[arg(long)]
    transport_port: u16,

    #[arg(long)]
    api_port: u16,

    /// Directory for the consensus state and snapshot files
    #[arg(long)]
    data_dir: PathBuf,

    /// Other members as id=host:port of their transport listener, comma separated
    #[arg(long, value_delimiter = ',', value_parser = parse_peer)]
    peers: Vec<(NodeId, String)>,

    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_min_ms: u64,

    #[arg(long, default_value_t = 600)]
    election_max_ms: u64,

    /// Applied entries between snapshots, 0 disables
    #[arg(long, default_value_t = 1000)]
    snapshot_threshold: u64,

    /// Order reads through the log instead of answering from local state
    #[arg(long)]
    linearizable_reads: bool,
}

fn parse_peer(spec: &str) -> Result<(NodeId, String), String> {
    let (id, addr) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got '{}'", spec))?;
    let id = id.parse().map_err(|_| format!("invalid peer id '{}'", id))?;
    Ok((id, addr.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("raftkv=info")))
        .init();

    let args = Args::parse();
    if args.id == 0 {
        bail!("node id 0 is reserved");
    }
    let peers: HashMap<NodeId, String> = args.peers.iter().cloned().collect();
    if peers.contains_key(&args.id) {
        bail!("--peers must not list this node ({})", args.id);
    }

    let raft_config = RaftConfig::default()
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_election_timeout(
            Duration::from_millis(args.election_min_ms),
            Duration::from_millis(args.election_max_ms),
        );
    raft_config.validate().context("invalid timing configuration")?;
    let read_mode = if args.linearizable_reads {
        ReadMode::Log
    } else {
        ReadMode::Local
    };
    let kv_config = KvConfig::default()
        .with_snapshot_threshold(args.snapshot_threshold)
        .with_read_mode(read_mode);

    info!(
        node = args.id,
        data_dir = %args.data_dir.display(),
        peers = ?peers,
        snapshot_threshold = args.snapshot_threshold,
        ?read_mode,
        "starting node"
    );

    let storage = FileStorage::new(&args.data_dir)
        .with_context(|| format!("opening data directory {}", args.data_dir.display()))?;
    let peer_ids: Vec<NodeId> = peers.keys().copied().collect();
    let transport = HttpTransport::new(peers, raft_config.rpc_timeout).context("building http client")?;

    let (apply_tx, apply_rx) = tokio::sync::mpsc::unbounded_channel();
    let core = RaftCore::new(args.id, peer_ids, Box::new(storage), apply_tx)
        .context("loading persisted consensus state")?;
    let (server, shared_core) = RaftServer::new(core, transport, raft_config);
    let kv = KvServer::start(server.start(), apply_rx, kv_config);

    let transport_addr = SocketAddr::from(([0, 0, 0, 0], args.transport_port));
    let transport_listener = TcpListener::bind(transport_addr)
        .await
        .with_context(|| format!("binding transport listener on {}", transport_addr))?;
    info!(node = args.id, addr = %transport_addr, "transport listening");
    let raft_router = create_raft_router(shared_core);
    let transport_task = tokio::spawn(async move { axum::serve(transport_listener, raft_router).await });

    let api_addr = SocketAddr::from(([0, 0, 0, 0], args.api_port));
    let api_listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding api listener on {}", api_addr))?;
    info!(node = args.id, addr = %api_addr, "client api listening");
    let kv_router = create_kv_router(kv.clone());
    let api_task = tokio::spawn(async move { axum::serve(api_listener, kv_router).await });

    tokio::select! {
        result = transport_task => result.context("transport server panicked")?.context("transport server failed")?,
        result = api_task => result.context("api server panicked")?.context("api server failed")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for ctrl-c")?;
            info!(node = args.id, "shutting down");
        }
    }

    kv.kill().await;
    Ok(())
}
