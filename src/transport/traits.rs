//! Wire messages and the outgoing RPC client seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{GroupId, LogIndex, PeerId, Term};

/// Errors from the RPC client.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("request timed out")]
    Timeout,
    #[error("target node not found")]
    NodeNotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub group_id: GroupId,
    /// The candidate.
    pub server_id: PeerId,
    /// The addressed replica.
    pub peer_id: PeerId,
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub granted: bool,
}

/// Per-entry metadata in an AppendEntries request. DATA payloads are not
/// carried here; they are concatenated in request order into
/// [`AppendEntriesRequest::data`], each `data_len` bytes long.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub term: Term,
    #[serde(rename = "type")]
    pub entry_type: u32,
    #[serde(default)]
    pub peers: Vec<PeerId>,
    #[serde(default)]
    pub data_len: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub group_id: GroupId,
    /// The leader.
    pub server_id: PeerId,
    /// The addressed replica.
    pub peer_id: PeerId,
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub committed_index: LogIndex,
    pub entries: Vec<EntryMeta>,
    /// Concatenated DATA payloads, in entry order.
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub last_log_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub group_id: GroupId,
    /// The leader.
    pub server_id: PeerId,
    /// The addressed replica.
    pub peer_id: PeerId,
    pub term: Term,
    pub last_included_log_index: LogIndex,
    pub last_included_log_term: Term,
    pub peers: Vec<PeerId>,
    /// Location the follower fetches the snapshot bundle from.
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub success: bool,
}

/// Outgoing RPC client. One instance per process, shared by every node the
/// registry hosts.
#[async_trait]
pub trait RaftClient: Send + Sync {
    async fn request_vote(
        &self,
        target: PeerId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError>;

    async fn append_entries(
        &self,
        target: PeerId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    async fn install_snapshot(
        &self,
        target: PeerId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError>;
}
