//! HTTP transport implementation for Raft RPC
//!
//! Uses axum for the server side and reqwest for the client side. Bodies
//! are the JSON-serialized RPC argument and result structs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, NodeId, RequestVoteArgs, RequestVoteResult, SharedCore,
};
use crate::transport::{Transport, TransportError};

/// HTTP transport for Raft RPC communication
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:7001")
    peers: HashMap<NodeId, String>,
    /// HTTP client with a per-request timeout
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport with peer addresses
    pub fn new(peers: HashMap<NodeId, String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");

        HttpTransport { peers, client }
    }

    async fn post_json<Args, Reply>(
        &self,
        target: NodeId,
        path: &str,
        args: &Args,
    ) -> Result<Reply, TransportError>
    where
        Args: serde::Serialize,
        Reply: serde::de::DeserializeOwned,
    {
        let addr = self.peers.get(&target).ok_or(TransportError::NodeNotFound)?;
        let url = format!("http://{}{}", addr, path);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;

        response
            .json::<Reply>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post_json(target, "/raft/request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post_json(target, "/raft/append_entries", &args).await
    }
}

/// Create an axum router serving the Raft RPC endpoints
pub fn create_raft_router(core: SharedCore) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .with_state(core)
}

async fn handle_request_vote(
    State(core): State<SharedCore>,
    Json(args): Json<RequestVoteArgs>,
) -> Json<RequestVoteResult> {
    let mut core = core.lock().await;
    Json(core.handle_request_vote(&args))
}

async fn handle_append_entries(
    State(core): State<SharedCore>,
    Json(args): Json<AppendEntriesArgs>,
) -> Json<AppendEntriesResult> {
    let mut core = core.lock().await;
    Json(core.handle_append_entries(&args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::raft_core::{ApplyMsg, RaftCore};
    use crate::storage::memory::MemoryPersister;
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    /// Serve a core's Raft endpoints on an ephemeral port, returning its address
    async fn spawn_raft_server(core: SharedCore) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_raft_router(core);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    fn new_test_core(id: NodeId, peers: Vec<NodeId>) -> (RaftCore, mpsc::UnboundedReceiver<ApplyMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = RaftCore::new(id, peers, Arc::new(MemoryPersister::new()), tx);
        (core, rx)
    }

    #[tokio::test]
    async fn test_request_vote_over_http() {
        let (core2, _rx) = new_test_core(2, vec![1]);
        let shared2 = Arc::new(Mutex::new(core2));
        let addr = spawn_raft_server(shared2.clone()).await;

        let transport =
            HttpTransport::new(HashMap::from([(2, addr)]), Duration::from_secs(1));
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = transport.request_vote(2, args).await.unwrap();

        assert!(result.vote_granted);
        assert_eq!(shared2.lock().await.voted_for, Some(1));
    }

    #[tokio::test]
    async fn test_append_entries_over_http() {
        let (core2, _rx) = new_test_core(2, vec![1]);
        let shared2 = Arc::new(Mutex::new(core2));
        let addr = spawn_raft_server(shared2.clone()).await;

        let transport =
            HttpTransport::new(HashMap::from([(2, addr)]), Duration::from_secs(1));
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![crate::core::raft_core::LogEntry {
                term: 1,
                command: b"x=1".to_vec(),
            }],
            leader_commit: 0,
        };
        let result = transport.append_entries(2, args).await.unwrap();

        assert!(result.success);
        assert_eq!(shared2.lock().await.last_log_index(), 1);
    }

    #[tokio::test]
    async fn test_unknown_peer_rejected() {
        let transport = HttpTransport::new(HashMap::new(), Duration::from_secs(1));
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = transport.request_vote(7, args).await;
        assert!(matches!(result, Err(TransportError::NodeNotFound)));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_connection_failure() {
        // Nothing listens on this port
        let transport = HttpTransport::new(
            HashMap::from([(2, "127.0.0.1:1".to_string())]),
            Duration::from_millis(200),
        );
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = transport.request_vote(2, args).await;
        assert!(result.is_err());
    }
}
