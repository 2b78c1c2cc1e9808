//! Key/value service node binary
//!
//! Runs a single node with separate ports for Raft RPC and the client API.
//!
//! Example for a 3-node cluster:
//!   raftkv-server --id 1 --raft-port 7001 --api-port 8001 --data-dir /tmp/kv1 \
//!       --peers 2=127.0.0.1:7002,3=127.0.0.1:7003
//!   raftkv-server --id 2 --raft-port 7002 --api-port 8002 --data-dir /tmp/kv2 \
//!       --peers 1=127.0.0.1:7001,3=127.0.0.1:7003
//!   raftkv-server --id 3 --raft-port 7003 --api-port 8003 --data-dir /tmp/kv3 \
//!       --peers 1=127.0.0.1:7001,2=127.0.0.1:7002

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raftkv::api::kv_http::create_kv_router;
use raftkv::core::raft_core::{NodeId, RaftCore};
use raftkv::core::raft_server::RaftServer;
use raftkv::kv::server::KvServer;
use raftkv::storage::file::FilePersister;
use raftkv::transport::http::{create_raft_router, HttpTransport};

/// A replicated key/value store node
#[derive(Parser, Debug)]
#[command(name = "raftkv-server")]
struct Args {
    /// Unique id of this node
    #[arg(long)]
    id: NodeId,

    /// Port for Raft RPC between nodes
    #[arg(long)]
    raft_port: u16,

    /// Port for the client API
    #[arg(long)]
    api_port: u16,

    /// Directory for persistent state
    #[arg(long)]
    data_dir: String,

    /// Peer addresses as id=host:port, comma separated
    #[arg(long, value_delimiter = ',', value_parser = parse_peer)]
    peers: Vec<(NodeId, String)>,

    /// Raft RPC request timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    rpc_timeout_ms: u64,
}

fn parse_peer(spec: &str) -> Result<(NodeId, String), String> {
    let (id, addr) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {:?}", spec))?;
    let id: NodeId = id
        .parse()
        .map_err(|_| format!("invalid peer id in {:?}", spec))?;
    Ok((id, addr.to_string()))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let peers: HashMap<NodeId, String> = args.peers.iter().cloned().collect();
    info!(id = args.id, ?peers, data_dir = %args.data_dir, "starting node");

    let persister = Arc::new(
        FilePersister::new(&args.data_dir).expect("failed to open data directory"),
    );

    let peer_ids: Vec<NodeId> = peers.keys().copied().collect();
    let transport = HttpTransport::new(peers, Duration::from_millis(args.rpc_timeout_ms));

    let (apply_tx, apply_rx) = mpsc::unbounded_channel();
    let core = RaftCore::new(args.id, peer_ids, persister.clone(), apply_tx);
    let (server, raft) = RaftServer::new(core, transport);
    let shared_core = raft.shared_core();
    let _raft_shutdown = server.start();

    let kv = Arc::new(KvServer::new(raft, persister, apply_rx));

    // Raft RPC endpoints for peers
    let raft_addr: SocketAddr = format!("0.0.0.0:{}", args.raft_port).parse().unwrap();
    let raft_listener = tokio::net::TcpListener::bind(raft_addr)
        .await
        .expect("failed to bind raft port");
    info!(%raft_addr, "raft RPC listening");
    let raft_router = create_raft_router(shared_core.clone());
    tokio::spawn(async move {
        axum::serve(raft_listener, raft_router).await.unwrap();
    });

    // Client API
    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse().unwrap();
    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .expect("failed to bind api port");
    info!(%api_addr, "client API listening");
    let kv_router = create_kv_router(kv, shared_core);
    axum::serve(api_listener, kv_router).await.unwrap();
}
