//! HTTP/JSON transport: reqwest client for outgoing RPCs, axum router for
//! the incoming Raft service. The router is mounted by
//! [`NodeRegistry::init`](crate::core::registry::NodeRegistry::init) and
//! dispatches on the `(group_id, peer_id)` carried in every request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::core::error::RaftError;
use crate::core::registry::NodeRegistry;
use crate::core::types::PeerId;
use crate::transport::traits::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftClient, RequestVoteRequest, RequestVoteResponse, TransportError,
};

/// Error payload returned when a handler cannot fill the normal response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

pub struct HttpRaftClient {
    client: reqwest::Client,
}

impl HttpRaftClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        HttpRaftClient { client }
    }

    async fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        target: &PeerId,
        path: &str,
        req: &Req,
    ) -> Result<Resp, TransportError> {
        let url = format!("http://{}/raft/{}", target.addr, path);
        let response = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;
        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed);
        }
        response
            .json::<Resp>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl RaftClient for HttpRaftClient {
    async fn request_vote(
        &self,
        target: PeerId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        self.post(&target, "request_vote", &req).await
    }

    async fn append_entries(
        &self,
        target: PeerId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        self.post(&target, "append_entries", &req).await
    }

    async fn install_snapshot(
        &self,
        target: PeerId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        self.post(&target, "install_snapshot", &req).await
    }
}

/// Router exposing the Raft service for every node in `registry`.
pub fn raft_router(registry: Arc<NodeRegistry>) -> Router {
    Router::new()
        .route("/raft/request_vote", post(request_vote))
        .route("/raft/append_entries", post(append_entries))
        .route("/raft/install_snapshot", post(install_snapshot))
        .with_state(registry)
}

fn error_response(status: StatusCode, err: RaftError) -> Response {
    (
        status,
        Json(ErrorBody {
            code: err.code(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn not_found(group: &str, peer: &PeerId) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        RaftError::NotFound(format!("no node for {group}:{peer}")),
    )
}

async fn request_vote(
    State(registry): State<Arc<NodeRegistry>>,
    Json(req): Json<RequestVoteRequest>,
) -> Response {
    let Some(node) = registry.get(&req.group_id, &req.peer_id) else {
        return not_found(&req.group_id, &req.peer_id);
    };
    match node.handle_request_vote(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn append_entries(
    State(registry): State<Arc<NodeRegistry>>,
    Json(req): Json<AppendEntriesRequest>,
) -> Response {
    let Some(node) = registry.get(&req.group_id, &req.peer_id) else {
        return not_found(&req.group_id, &req.peer_id);
    };
    match node.handle_append_entries(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn install_snapshot(
    State(registry): State<Arc<NodeRegistry>>,
    Json(req): Json<InstallSnapshotRequest>,
) -> Response {
    let Some(node) = registry.get(&req.group_id, &req.peer_id) else {
        return not_found(&req.group_id, &req.peer_id);
    };
    match node.handle_install_snapshot(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}
