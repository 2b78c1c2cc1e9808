//! HTTP client API for the key/value service
//!
//! Endpoints:
//! - `POST /kv/get` - linearizable read
//! - `POST /kv/put_append` - Put or Append
//! - `GET /kv/status` - node role, term, leader hint, log progress

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::core::raft_core::{NodeId, SharedCore};
use crate::kv::op::{OpKind, RequestId};
use crate::kv::server::{GetReply, KvServer, PutAppendReply};

/// Shared key/value server
pub type SharedKv = Arc<KvServer>;

/// State for the client HTTP handlers
#[derive(Clone)]
pub struct KvApiState {
    /// The key/value server handling Get / PutAppend
    pub kv: SharedKv,
    /// Shared Raft core for status reporting
    pub core: SharedCore,
}

/// Request body for a Get
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
    pub request_id: RequestId,
}

/// Request body for a Put or Append
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendRequest {
    pub op: OpKind,
    pub key: String,
    pub value: String,
    pub request_id: RequestId,
}

/// Response for the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub node_id: NodeId,
    pub role: String,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub log_length: u64,
}

/// Create an axum router for the client HTTP API
pub fn create_kv_router(kv: SharedKv, core: SharedCore) -> Router {
    let state = KvApiState { kv, core };
    Router::new()
        .route("/kv/get", post(handle_get))
        .route("/kv/put_append", post(handle_put_append))
        .route("/kv/status", get(handle_status))
        .with_state(state)
}

async fn handle_get(
    State(state): State<KvApiState>,
    Json(request): Json<GetRequest>,
) -> Json<GetReply> {
    Json(state.kv.get(&request.key, request.request_id).await)
}

async fn handle_put_append(
    State(state): State<KvApiState>,
    Json(request): Json<PutAppendRequest>,
) -> Result<Json<PutAppendReply>, (StatusCode, String)> {
    if request.op == OpKind::Get {
        return Err((
            StatusCode::BAD_REQUEST,
            "op must be Put or Append".to_string(),
        ));
    }
    Ok(Json(
        state
            .kv
            .put_append(request.op, &request.key, &request.value, request.request_id)
            .await,
    ))
}

async fn handle_status(State(state): State<KvApiState>) -> Json<StatusResponse> {
    let core = state.core.lock().await;
    Json(StatusResponse {
        node_id: core.id,
        role: core.role.kind().as_str().to_string(),
        term: core.current_term,
        leader_id: core.current_leader,
        commit_index: core.commit_index,
        last_applied: core.last_applied,
        log_length: core.last_log_index(),
    })
}
