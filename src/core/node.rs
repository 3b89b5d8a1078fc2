//! The consensus node state machine.
//!
//! A `Node` drives one replica of one replication group: it elects
//! leaders, replicates the log, advances the commit index by quorum and
//! coordinates snapshots. All state transitions happen under a single
//! mutex; blocking work (log writes, state-machine applies, RPC, snapshot
//! I/O) is dispatched to dedicated tasks and re-enters through the lock.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, Mutex};

use crate::core::commit::{CommitBatch, CommitDone, CommitManager};
use crate::core::config::{random_timeout, NodeOptions, NodeTimings};
use crate::core::configuration::{Configuration, ConfigurationPair};
use crate::core::error::RaftError;
use crate::core::fsm_caller::{self, ApplyTask};
use crate::core::log_manager::{LogManager, StableAck};
use crate::core::registry::NodeRegistry;
use crate::core::replication::ReplicatorGroup;
use crate::core::snapshot::SnapshotCoordinator;
use crate::core::timer::{Timer, TimerSet};
use crate::core::types::{EntryType, GroupId, LogEntry, LogIndex, NodeId, PeerId, Role, Term};
use crate::core::vote::VoteContext;
use crate::state_machine::StateMachine;
use crate::storage;
use crate::storage::traits::{SnapshotStorage, StableStorage};
use crate::transport::traits::{
    AppendEntriesRequest, AppendEntriesResponse, RaftClient, RequestVoteRequest,
    RequestVoteResponse,
};

/// Handle to a consensus node. Cloning is cheap and shares the node; every
/// outstanding clone keeps the node alive.
#[derive(Clone)]
pub struct Node {
    pub(crate) shared: Arc<NodeShared>,
}

pub(crate) struct NodeShared {
    pub(crate) node_id: NodeId,
    pub(crate) registry: Arc<NodeRegistry>,
    pub(crate) state: Mutex<NodeState>,
    /// Serialized by the snapshot_saving/loading flags, locked separately
    /// so snapshot file I/O never runs under the node mutex.
    pub(crate) snapshot_storage: Mutex<Option<Box<dyn SnapshotStorage>>>,
}

/// Everything constructed by `init`.
pub(crate) struct Engine {
    pub(crate) log: LogManager,
    pub(crate) stable: Box<dyn StableStorage>,
    pub(crate) commit: CommitManager,
    pub(crate) fsm: tokio::sync::mpsc::UnboundedSender<ApplyTask>,
    pub(crate) client: Arc<dyn RaftClient>,
    pub(crate) timings: NodeTimings,
}

pub(crate) struct NodeState {
    pub(crate) role: Role,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<PeerId>,
    pub(crate) leader_id: Option<PeerId>,
    pub(crate) conf: ConfigurationPair,
    /// Old peer set while a configuration-change entry is outstanding.
    pub(crate) conf_change_ctx: Option<Vec<PeerId>>,
    pub(crate) vote_ctx: VoteContext,
    pub(crate) last_snapshot_index: LogIndex,
    pub(crate) last_snapshot_term: Term,
    pub(crate) last_leader_timestamp: Instant,
    pub(crate) snapshot_flags: SnapshotCoordinator,
    pub(crate) timers: TimerSet,
    pub(crate) replicators: ReplicatorGroup,
    pub(crate) engine: Option<Engine>,
}

/// Point-in-time view of a node, for inspection and tests.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<PeerId>,
    pub leader_id: Option<PeerId>,
    pub last_log_index: LogIndex,
    pub committed_index: LogIndex,
    pub last_snapshot_index: LogIndex,
    pub last_snapshot_term: Term,
    pub peers: Vec<PeerId>,
}

impl Node {
    /// Create a node for `(group_id, replica_id)`. The endpoint half of the
    /// server id comes from the registry's bound address; `init` fails if
    /// the registry has none yet.
    pub fn new(group_id: GroupId, replica_id: u32, registry: Arc<NodeRegistry>) -> Node {
        let addr = registry
            .address()
            .unwrap_or_else(|| std::net::SocketAddr::from(([0, 0, 0, 0], 0)));
        let server_id = PeerId::new(addr, replica_id);
        Node {
            shared: Arc::new(NodeShared {
                node_id: NodeId::new(group_id, server_id),
                registry,
                state: Mutex::new(NodeState {
                    role: Role::Shutdown,
                    current_term: 0,
                    voted_for: None,
                    leader_id: None,
                    conf: ConfigurationPair::default(),
                    conf_change_ctx: None,
                    vote_ctx: VoteContext::new(),
                    last_snapshot_index: 0,
                    last_snapshot_term: 0,
                    last_leader_timestamp: Instant::now(),
                    snapshot_flags: SnapshotCoordinator::default(),
                    timers: TimerSet::default(),
                    replicators: ReplicatorGroup::new(),
                    engine: None,
                }),
                snapshot_storage: Mutex::new(None),
            }),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.shared.node_id
    }

    pub fn server_id(&self) -> PeerId {
        self.shared.node_id.peer_id
    }

    pub fn group_id(&self) -> &GroupId {
        &self.shared.node_id.group_id
    }

    /// Initialize storage (log, then stable, then snapshot), replay any
    /// existing snapshot into the state machine, register with the node
    /// registry and become a follower.
    pub async fn init(&self, mut options: NodeOptions) -> Result<(), RaftError> {
        if self.server_id().is_empty() {
            return Err(RaftError::invalid("raft server not initialized: no bound address"));
        }
        let client = self
            .shared
            .registry
            .client()
            .ok_or_else(|| RaftError::invalid("registry has no transport client"))?;
        let mut fsm = options
            .fsm
            .take()
            .ok_or_else(|| RaftError::invalid("options.fsm is required"))?;

        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.engine.is_some() {
            return Err(RaftError::invalid("node already initialized"));
        }

        // log storage
        let provider = storage::find_provider(&options.log_uri).ok_or_else(|| {
            RaftError::NotFound(format!("no storage provider for {}", options.log_uri))
        })?;
        let log_storage = provider
            .create_log_storage(&options.log_uri)
            .map_err(|e| RaftError::Io(e.to_string()))?;
        let mut log = LogManager::new(log_storage).map_err(|e| RaftError::Io(e.to_string()))?;

        // stable storage
        let provider = storage::find_provider(&options.stable_uri).ok_or_else(|| {
            RaftError::NotFound(format!("no storage provider for {}", options.stable_uri))
        })?;
        let mut stable = provider
            .create_stable_storage(&options.stable_uri)
            .map_err(|e| RaftError::Io(e.to_string()))?;
        let (term, voted_for) = stable.load().map_err(|e| RaftError::Io(e.to_string()))?;
        s.current_term = term;
        s.voted_for = voted_for;

        // snapshot storage, loading any existing snapshot before the log
        // settles the effective configuration
        if !options.snapshot_uri.is_empty() {
            let provider = storage::find_provider(&options.snapshot_uri).ok_or_else(|| {
                RaftError::NotFound(format!("no storage provider for {}", options.snapshot_uri))
            })?;
            let mut snapshot_storage = provider
                .create_snapshot_storage(&options.snapshot_uri)
                .map_err(|e| RaftError::Io(e.to_string()))?;
            let reader = snapshot_storage
                .open()
                .map_err(|e| RaftError::Io(e.to_string()))?;
            if let Some(mut reader) = reader {
                let meta = reader.meta();
                fsm.on_snapshot_load(reader.as_mut())?;
                s.last_snapshot_index = meta.last_included_index;
                s.last_snapshot_term = meta.last_included_term;
                Self::reconcile_log_with_snapshot(
                    &mut log,
                    meta.last_included_index,
                    meta.last_included_term,
                );
                log.set_snapshot_configuration(
                    meta.last_included_index,
                    meta.last_configuration.clone(),
                );
            }
            *self.shared.snapshot_storage.lock().await = Some(snapshot_storage);
        }

        // configuration comes from the log when one exists, else options
        if log.last_log_index() > 0 {
            log.check_and_set_configuration(&mut s.conf);
        } else {
            s.conf.conf = options.initial_conf.clone();
        }

        let last_applied = s.last_snapshot_index;
        let fsm_tx = fsm_caller::spawn(self.clone(), fsm, last_applied, s.last_snapshot_term);
        let commit = CommitManager::new(options.max_pending_applications, last_applied);
        let timings = NodeTimings {
            election_timeout_ms: options.election_timeout_ms,
            snapshot_interval_ms: options.snapshot_interval_ms,
            snapshot_uri: options.snapshot_uri.clone(),
            catchup_margin: options.catchup_margin,
        };
        s.engine = Some(Engine {
            log,
            stable,
            commit,
            fsm: fsm_tx,
            client,
            timings,
        });

        if !self.shared.registry.add(self.clone()) {
            // roll back so the duplicate node does not leak its applier
            if let Some(engine) = s.engine.take() {
                let (tx, _rx) = oneshot::channel();
                let _ = engine.fsm.send(ApplyTask::Shutdown { done: tx });
            }
            return Err(RaftError::AlreadyExists(format!(
                "node {} already registered",
                self.shared.node_id
            )));
        }

        s.role = Role::Follower;
        tracing::info!(
            node = %self.shared.node_id,
            term = s.current_term,
            last_log_index = self.last_log_index_of(s),
            conf = %s.conf.conf,
            "node initialized"
        );

        if !s.conf.conf.is_empty() {
            let term = s.current_term;
            self.step_down(s, term);
        }

        let snapshot_enabled =
            !options.snapshot_uri.is_empty() && options.snapshot_interval_ms > 0;
        if snapshot_enabled {
            self.arm_snapshot_timer(s);
        }
        Ok(())
    }

    pub(crate) fn reconcile_log_with_snapshot(
        log: &mut LogManager,
        snap_index: LogIndex,
        snap_term: Term,
    ) {
        let term_disagrees = log.first_log_index() <= snap_index
            && log.term_at(snap_index).map(|t| t != snap_term).unwrap_or(false);
        if log.last_log_index() < snap_index || term_disagrees {
            if log.first_log_index() <= log.last_log_index() {
                tracing::warn!("discarding entire log, superseded by snapshot");
            }
            log.truncate_prefix(snap_index + 1);
            log.truncate_suffix(snap_index);
        }
        if log.first_log_index() <= snap_index {
            log.truncate_prefix(snap_index + 1);
        }
    }

    /// Replicate an opaque command. Resolves once the entry is committed
    /// and applied, or with the failure that prevented it.
    pub async fn apply(&self, data: Vec<u8>) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role == Role::Shutdown || s.engine.is_none() {
                return Err(RaftError::invalid("node is shut down"));
            }
            if s.role != Role::Leader {
                return Err(RaftError::NotPermitted(format!(
                    "apply called on a {}",
                    s.role
                )));
            }
            let entry = LogEntry::data(s.current_term, 0, data);
            self.append_leader_entry(s, entry, CommitDone::Reply(tx));
        }
        rx.await
            .map_err(|_| RaftError::invalid("node shut down before commit"))?
    }

    /// Add `peer` to the configuration: start a replicator, wait for it to
    /// catch up, then replicate the ADD_PEER entry. Resolves when the new
    /// configuration commits.
    pub async fn add_peer(&self, old_peers: &[PeerId], peer: PeerId) -> Result<(), RaftError> {
        let election_timeout;
        let margin;
        let mut wait = {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role != Role::Leader {
                return Err(RaftError::NotPermitted("add_peer requires leadership".into()));
            }
            if s.conf_change_ctx.is_some() {
                return Err(RaftError::Retry("configuration change in progress".into()));
            }
            if !s.conf.conf.equals(old_peers) {
                return Err(RaftError::invalid("old_peers does not match current configuration"));
            }
            if s.conf.conf.contains(&peer) {
                return Err(RaftError::invalid("peer already in configuration"));
            }
            let engine = s.engine.as_ref().expect("leader is initialized");
            election_timeout = engine.timings.election_timeout();
            margin = engine.timings.catchup_margin;
            let client = engine.client.clone();
            let next_index = engine.log.last_log_index() + 1;
            tracing::info!(node = %self.shared.node_id, peer = %peer, "add_peer: waiting for catch-up");
            s.replicators.start(self.clone(), client, peer, next_index);
            s.replicators
                .wait_caughtup(peer, margin, Instant::now() + election_timeout)?
        };

        loop {
            let outcome = wait
                .await
                .unwrap_or_else(|_| Err(RaftError::invalid("replicator stopped")));
            match outcome {
                Ok(()) => break,
                Err(RaftError::TimedOut(_)) => {
                    let mut guard = self.shared.state.lock().await;
                    let s = &mut *guard;
                    if s.role != Role::Leader {
                        s.replicators.stop(&peer);
                        return Err(RaftError::NotPermitted(
                            "leadership lost during catch-up".into(),
                        ));
                    }
                    let still_progressing = s
                        .replicators
                        .last_response(&peer)
                        .map(|t| t.elapsed() <= election_timeout)
                        .unwrap_or(false);
                    if !still_progressing {
                        s.replicators.stop(&peer);
                        return Err(RaftError::TimedOut(format!("peer {peer} catch-up")));
                    }
                    tracing::info!(peer = %peer, "add_peer: still catching up");
                    wait = s
                        .replicators
                        .wait_caughtup(peer, margin, Instant::now() + election_timeout)?;
                }
                Err(e) => {
                    let mut guard = self.shared.state.lock().await;
                    guard.replicators.stop(&peer);
                    return Err(e);
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role != Role::Leader {
                s.replicators.stop(&peer);
                return Err(RaftError::NotPermitted("leadership lost during catch-up".into()));
            }
            let mut new_conf = s.conf.conf.clone();
            new_conf.add_peer(peer);
            let entry =
                LogEntry::configuration(s.current_term, 0, EntryType::AddPeer, new_conf.to_vec());
            self.append_leader_entry(s, entry, CommitDone::Reply(tx));
        }
        rx.await
            .map_err(|_| RaftError::invalid("node shut down before commit"))?
    }

    /// Remove `peer` from the configuration. Resolves when the REMOVE_PEER
    /// entry commits under the shrunken configuration.
    pub async fn remove_peer(&self, old_peers: &[PeerId], peer: PeerId) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role != Role::Leader {
                return Err(RaftError::NotPermitted("remove_peer requires leadership".into()));
            }
            if s.conf_change_ctx.is_some() {
                return Err(RaftError::Retry("configuration change in progress".into()));
            }
            if !s.conf.conf.equals(old_peers) {
                return Err(RaftError::invalid("old_peers does not match current configuration"));
            }
            if !s.conf.conf.contains(&peer) {
                return Err(RaftError::invalid("peer not in configuration"));
            }
            tracing::info!(node = %self.shared.node_id, peer = %peer, "remove_peer");
            let mut new_conf = s.conf.conf.clone();
            new_conf.remove_peer(&peer);
            let entry = LogEntry::configuration(
                s.current_term,
                0,
                EntryType::RemovePeer,
                new_conf.to_vec(),
            );
            self.append_leader_entry(s, entry, CommitDone::Reply(tx));
        }
        rx.await
            .map_err(|_| RaftError::invalid("node shut down before commit"))?
    }

    /// Administrative recovery: bootstrap an empty node, or force a
    /// minority sub-quorum configuration on a group that lost quorum.
    pub async fn set_peer(
        &self,
        old_peers: &[PeerId],
        new_peers: &[PeerId],
    ) -> Result<(), RaftError> {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role == Role::Shutdown || s.engine.is_none() {
            return Err(RaftError::invalid("node is shut down"));
        }
        // bootstrap
        if s.conf.conf.is_empty() && old_peers.is_empty() {
            let new_conf = Configuration::from(new_peers.to_vec());
            tracing::info!(node = %self.shared.node_id, conf = %new_conf, "set_peer: bootstrap");
            s.conf.conf = new_conf;
            self.step_down(s, 1);
            return Ok(());
        }
        if s.role == Role::Leader && s.conf_change_ctx.is_some() {
            return Err(RaftError::Retry("configuration change in progress".into()));
        }
        if !s.conf.conf.equals(old_peers) {
            return Err(RaftError::invalid("old_peers does not match current configuration"));
        }
        // forced reconfiguration must shrink below the old quorum
        if new_peers.len() >= old_peers.len() / 2 + 1 {
            return Err(RaftError::invalid("new_peers must be smaller than the old quorum"));
        }
        if !s.conf.conf.contains_all(new_peers) {
            return Err(RaftError::invalid("new_peers is not a subset of current configuration"));
        }
        let new_conf = Configuration::from(new_peers.to_vec());
        tracing::warn!(
            node = %self.shared.node_id,
            from = %s.conf.conf,
            to = %new_conf,
            "set_peer: forced reconfiguration"
        );
        let term = s.current_term + 1;
        self.step_down(s, term);
        s.conf.conf = new_conf;
        Ok(())
    }

    /// Administrative term bump, used when RPC client glue observes a
    /// response term above the local one.
    pub async fn increase_term_to(&self, term: Term) -> Result<(), RaftError> {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if term <= s.current_term {
            return Err(RaftError::invalid("term is not larger than current"));
        }
        self.step_down(s, term);
        Ok(())
    }

    /// Stop the node: deregister, step down, cancel timers and drain the
    /// applier. Resolves when the applier has drained.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        self.shared.registry.remove(&self.shared.node_id);
        let fsm_done = {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role == Role::Shutdown && s.engine.is_none() {
                return Ok(());
            }
            tracing::info!(node = %self.shared.node_id, term = s.current_term, role = %s.role, "shutdown");
            if matches!(s.role, Role::Leader | Role::Candidate) {
                let term = s.current_term;
                self.step_down(s, term);
            }
            s.timers.cancel_all();
            s.role = Role::Shutdown;
            s.replicators.stop_all();
            if let Some(engine) = s.engine.as_mut() {
                let _ = engine.log.shutdown();
                let (tx, rx) = oneshot::channel();
                let _ = engine.fsm.send(ApplyTask::Shutdown { done: tx });
                Some(rx)
            } else {
                None
            }
        };
        if let Some(rx) = fsm_done {
            let _ = rx.await;
        }
        Ok(())
    }

    pub async fn role(&self) -> Role {
        self.shared.state.lock().await.role
    }

    pub async fn leader_id(&self) -> Option<PeerId> {
        self.shared.state.lock().await.leader_id
    }

    pub async fn list_peers(&self) -> Vec<PeerId> {
        self.shared.state.lock().await.conf.conf.to_vec()
    }

    pub async fn describe(&self) -> NodeStatus {
        let guard = self.shared.state.lock().await;
        NodeStatus {
            role: guard.role,
            term: guard.current_term,
            voted_for: guard.voted_for,
            leader_id: guard.leader_id,
            last_log_index: self.last_log_index_of(&guard),
            committed_index: guard
                .engine
                .as_ref()
                .map(|e| e.commit.last_committed_index())
                .unwrap_or(0),
            last_snapshot_index: guard.last_snapshot_index,
            last_snapshot_term: guard.last_snapshot_term,
            peers: guard.conf.conf.to_vec(),
        }
    }

    // ===== RPC handlers (entered through the registry) =====

    pub async fn handle_request_vote(
        &self,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role == Role::Shutdown || s.engine.is_none() {
            return Err(RaftError::invalid("node is shut down"));
        }
        let candidate = req.server_id;
        let last_log_index = self.last_log_index_of(s);
        let last_log_term = self.last_log_term_of(s);
        let log_is_ok = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);

        if s.leader_id.is_some() {
            // network-partition guard: ignore vote requests while we still
            // believe a leader exists
            tracing::info!(
                node = %self.shared.node_id,
                candidate = %candidate,
                leader = ?s.leader_id,
                "reject RequestVote, leader is alive"
            );
        } else if req.term >= s.current_term {
            tracing::info!(
                node = %self.shared.node_id,
                candidate = %candidate,
                term = req.term,
                current_term = s.current_term,
                "received RequestVote"
            );
            if req.term > s.current_term {
                self.step_down(s, req.term);
            }
            if log_is_ok && s.voted_for.is_none() {
                s.voted_for = Some(candidate);
                if let Some(engine) = s.engine.as_mut() {
                    if let Err(e) = engine.stable.set_voted_for(Some(candidate)) {
                        tracing::error!(error = %e, "persist voted_for failed");
                    }
                }
            }
        } else {
            tracing::info!(
                node = %self.shared.node_id,
                candidate = %candidate,
                term = req.term,
                current_term = s.current_term,
                "ignore RequestVote with stale term"
            );
        }

        Ok(RequestVoteResponse {
            term: s.current_term,
            granted: req.term == s.current_term && s.voted_for == Some(candidate),
        })
    }

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        let expected: usize = req.entries.iter().map(|m| m.data_len as usize).sum();
        if expected > req.data.len() {
            return Err(RaftError::invalid("data buffer shorter than declared lengths"));
        }

        let (response_term, last_log_index, persist) = {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role == Role::Shutdown || s.engine.is_none() {
                return Err(RaftError::invalid("node is shut down"));
            }

            // stale leader
            if req.term < s.current_term {
                tracing::warn!(
                    node = %self.shared.node_id,
                    from = %req.server_id,
                    term = req.term,
                    current_term = s.current_term,
                    "ignore stale AppendEntries"
                );
                return Ok(AppendEntriesResponse {
                    term: s.current_term,
                    success: false,
                    last_log_index: self.last_log_index_of(s),
                });
            }

            if req.term > s.current_term || s.role != Role::Follower {
                self.step_down(s, req.term);
            }
            if s.leader_id.is_none() {
                s.leader_id = Some(req.server_id);
            }

            // an install is rewriting the log/snapshot boundary; make the
            // leader retry rather than interleave
            if s.snapshot_flags.loading.is_some() {
                return Ok(AppendEntriesResponse {
                    term: s.current_term,
                    success: false,
                    last_log_index: self.last_log_index_of(s),
                });
            }

            let engine = s.engine.as_mut().expect("checked above");

            // gap: leader will back off
            if req.prev_log_index > engine.log.last_log_index() {
                tracing::warn!(
                    node = %self.shared.node_id,
                    prev_log_index = req.prev_log_index,
                    last_log_index = engine.log.last_log_index(),
                    "reject index-gapped AppendEntries"
                );
                return Ok(AppendEntriesResponse {
                    term: s.current_term,
                    success: false,
                    last_log_index: engine.log.last_log_index(),
                });
            }

            // conflicting prev entry: reject without truncating here
            if req.prev_log_index >= engine.log.first_log_index() {
                let local_term = engine.log.term_at(req.prev_log_index).unwrap_or(0);
                if local_term != req.prev_log_term {
                    tracing::warn!(
                        node = %self.shared.node_id,
                        prev_log_index = req.prev_log_index,
                        prev_log_term = req.prev_log_term,
                        local_term,
                        "reject term-unmatched AppendEntries"
                    );
                    return Ok(AppendEntriesResponse {
                        term: s.current_term,
                        success: false,
                        last_log_index: engine.log.last_log_index(),
                    });
                }
            }

            let mut to_append: Vec<LogEntry> = Vec::new();
            let mut index = req.prev_log_index;
            let mut offset = 0usize;
            for meta in &req.entries {
                index += 1;
                let data_len = meta.data_len as usize;
                let payload = if data_len > 0 {
                    let chunk = req.data[offset..offset + data_len].to_vec();
                    offset += data_len;
                    chunk
                } else {
                    Vec::new()
                };

                if index < engine.log.first_log_index() {
                    // subsumed by snapshot
                    continue;
                }
                if engine.log.last_log_index() >= index {
                    if engine.log.term_at(index) == Some(meta.term) {
                        // idempotent duplicate
                        continue;
                    }
                    let last_index_kept = index - 1;
                    tracing::warn!(
                        node = %self.shared.node_id,
                        from = engine.log.last_log_index(),
                        to = last_index_kept,
                        "truncate conflicting suffix"
                    );
                    engine.log.truncate_suffix(last_index_kept);
                    engine.log.check_and_set_configuration(&mut s.conf);
                }

                let entry_type = EntryType::from_wire(meta.entry_type);
                if entry_type == EntryType::Unknown {
                    // unrecognized entry kinds are dropped
                    continue;
                }
                let peers = if meta.peers.is_empty() {
                    None
                } else {
                    Some(meta.peers.clone())
                };
                to_append.push(LogEntry {
                    term: meta.term,
                    index,
                    entry_type,
                    data: payload,
                    peers,
                });
            }

            if to_append.is_empty() {
                // heartbeat, or a fully duplicated batch: nothing to persist
                let last = engine.log.last_log_index();
                if let Some(batch) = engine
                    .commit
                    .set_last_committed_index(req.committed_index.min(last))
                {
                    Self::deliver_commit_batch(engine, batch);
                }
                s.last_leader_timestamp = Instant::now();
                return Ok(AppendEntriesResponse {
                    term: s.current_term,
                    success: true,
                    last_log_index: last,
                });
            }

            let (tx, rx) = oneshot::channel();
            engine.log.append(to_append, StableAck::Rpc(tx));
            engine.log.check_and_set_configuration(&mut s.conf);
            (s.current_term, engine.log.last_log_index(), rx)
        };

        // wait for durability without holding the node mutex
        match persist.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RaftError::Io(e.to_string())),
            Err(_) => return Err(RaftError::Io("log worker stopped".into())),
        }

        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        // the role or term may have moved while the write was in flight;
        // only a follower still serving this term adopts the commit index
        if s.role == Role::Follower && s.current_term == response_term {
            if let Some(engine) = s.engine.as_mut() {
                let last = engine.log.last_log_index();
                if let Some(batch) = engine
                    .commit
                    .set_last_committed_index(req.committed_index.min(last))
                {
                    Self::deliver_commit_batch(engine, batch);
                }
            }
            s.last_leader_timestamp = Instant::now();
        }
        Ok(AppendEntriesResponse {
            term: response_term,
            success: true,
            last_log_index,
        })
    }

    // ===== internals, all entered with the state lock held =====

    /// Shared role-demotion path: clears volatile election state, persists
    /// `(term, voted_for)` and re-arms the election timer when this node
    /// remains a voting member.
    pub(crate) fn step_down(&self, s: &mut NodeState, term: Term) {
        tracing::info!(
            node = %self.shared.node_id,
            term = s.current_term,
            new_term = term,
            from = %s.role,
            "step down"
        );
        match s.role {
            Role::Candidate => {
                if let Some(timer) = s.timers.vote.take() {
                    timer.cancel();
                }
            }
            Role::Leader => {
                if let Some(timer) = s.timers.step_down.take() {
                    timer.cancel();
                }
                if let Some(engine) = s.engine.as_mut() {
                    engine.commit.clear_pending_applications();
                    let _ = engine.fsm.send(ApplyTask::LeaderStop);
                }
            }
            _ => {}
        }

        s.role = Role::Follower;
        s.leader_id = None;
        s.current_term = term;
        s.voted_for = None;
        s.conf_change_ctx = None;
        if let Some(engine) = s.engine.as_mut() {
            if let Err(e) = engine.stable.set_term_and_voted_for(term, None) {
                tracing::error!(error = %e, "persist term failed");
            }
        }

        if !s.conf.conf.is_empty() && s.conf.conf.contains(&self.server_id()) {
            self.arm_election_timer(s);
        }
        s.replicators.stop_all();
    }

    /// Become candidate and solicit votes for a fresh term.
    pub(crate) fn elect_self(&self, s: &mut NodeState) {
        if s.role == Role::Follower {
            if let Some(timer) = s.timers.election.take() {
                timer.cancel();
            }
        }
        s.role = Role::Candidate;
        s.current_term += 1;
        s.voted_for = Some(self.server_id());
        s.leader_id = None;
        s.vote_ctx.reset(s.conf.conf.len());
        tracing::info!(
            node = %self.shared.node_id,
            term = s.current_term,
            "start election, vote for self"
        );
        self.arm_vote_timer(s);

        let term = s.current_term;
        let last_log_index = self.last_log_index_of(s);
        let last_log_term = self.last_log_term_of(s);
        let client = match s.engine.as_ref() {
            Some(engine) => engine.client.clone(),
            None => return,
        };
        for peer in s.conf.conf.to_vec() {
            if peer == self.server_id() {
                continue;
            }
            let req = RequestVoteRequest {
                group_id: self.group_id().clone(),
                server_id: self.server_id(),
                peer_id: peer,
                term,
                last_log_index,
                last_log_term,
            };
            let node = self.clone();
            let client = client.clone();
            tokio::spawn(async move {
                match client.request_vote(peer, req).await {
                    Ok(resp) => node.handle_request_vote_response(peer, term, resp).await,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "RequestVote rpc failed")
                    }
                }
            });
        }

        s.vote_ctx.grant(self.server_id());
        if let Some(engine) = s.engine.as_mut() {
            if let Err(e) = engine
                .stable
                .set_term_and_voted_for(term, Some(self.server_id()))
            {
                tracing::error!(error = %e, "persist term failed");
            }
        }
        if s.vote_ctx.quorum() {
            self.become_leader(s);
        }
    }

    pub(crate) async fn handle_request_vote_response(
        &self,
        peer: PeerId,
        rpc_term: Term,
        resp: RequestVoteResponse,
    ) {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role != Role::Candidate {
            return;
        }
        // stale response from a previous attempt
        if rpc_term != s.current_term {
            return;
        }
        if resp.term > s.current_term {
            tracing::info!(
                node = %self.shared.node_id,
                peer = %peer,
                term = resp.term,
                "higher term in RequestVote response"
            );
            self.step_down(s, resp.term);
            return;
        }
        if resp.granted {
            s.vote_ctx.grant(peer);
            if s.vote_ctx.quorum() {
                self.become_leader(s);
            }
        }
    }

    fn become_leader(&self, s: &mut NodeState) {
        debug_assert_eq!(s.role, Role::Candidate);
        if let Some(timer) = s.timers.vote.take() {
            timer.cancel();
        }
        s.role = Role::Leader;
        s.leader_id = Some(self.server_id());
        tracing::info!(
            node = %self.shared.node_id,
            term = s.current_term,
            conf = %s.conf.conf,
            "become leader"
        );

        let (heartbeat, client, next_index) = {
            let engine = s.engine.as_ref().expect("leader is initialized");
            (
                engine.timings.heartbeat_timeout(),
                engine.client.clone(),
                engine.log.last_log_index() + 1,
            )
        };
        s.replicators.reset(s.current_term, heartbeat);
        for peer in s.conf.conf.to_vec() {
            if peer == self.server_id() {
                continue;
            }
            s.replicators
                .start(self.clone(), client.clone(), peer, next_index);
        }

        if let Some(engine) = s.engine.as_mut() {
            engine.commit.reset_pending_index(next_index);
        }

        // anchor leader completeness in this term with a configuration
        // entry carrying the current peer set; its completion is the
        // on_leader_start hook
        let entry = LogEntry::configuration(
            s.current_term,
            0,
            EntryType::AddPeer,
            s.conf.conf.to_vec(),
        );
        self.append_leader_entry(s, entry, CommitDone::LeaderStart);

        self.arm_stepdown_timer(s);
    }

    /// Leader-side append: reserves a commit ballot, hands the entry to the
    /// log manager and records a pending configuration change when the
    /// effective configuration moved.
    pub(crate) fn append_leader_entry(
        &self,
        s: &mut NodeState,
        mut entry: LogEntry,
        done: CommitDone,
    ) {
        let Some(engine) = s.engine.as_mut() else {
            done.fail(RaftError::invalid("node is shut down"));
            return;
        };
        let index = engine.log.last_log_index() + 1;
        entry.index = index;
        entry.term = s.current_term;
        let ballot_conf = match entry.entry_type {
            EntryType::AddPeer | EntryType::RemovePeer => {
                Configuration::from(entry.peers.clone().unwrap_or_default())
            }
            _ => s.conf.conf.clone(),
        };
        let old_peers = s.conf.conf.to_vec();
        if engine
            .commit
            .append_pending_application(ballot_conf, done)
            .is_err()
        {
            return;
        }
        engine.log.append(
            vec![entry],
            StableAck::Leader {
                node: self.clone(),
                index,
            },
        );
        if engine.log.check_and_set_configuration(&mut s.conf) {
            s.conf_change_ctx = Some(old_peers);
        }
        s.replicators.wake_all();
    }

    /// Durable-ack entry point: empty peer means the leader's own log.
    pub(crate) async fn advance_commit_index(&self, peer: PeerId, index: LogIndex) {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        let Some(engine) = s.engine.as_mut() else {
            return;
        };
        let peer = if peer.is_empty() { self.server_id() } else { peer };
        if let Some(batch) = engine.commit.set_stable_at_peer(index, peer) {
            Self::deliver_commit_batch(engine, batch);
        }
    }

    pub(crate) fn deliver_commit_batch(engine: &mut Engine, batch: CommitBatch) {
        let entries = engine.log.entries_in(batch.from_index, batch.to_index);
        let _ = engine.fsm.send(ApplyTask::Committed {
            entries,
            dones: batch.dones,
        });
    }

    /// Runs in the applier when a configuration entry this leader proposed
    /// has committed and applied.
    pub(crate) async fn on_configuration_change_done(
        &self,
        entry_type: EntryType,
        new_peers: Vec<PeerId>,
    ) {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role != Role::Leader || s.conf_change_ctx.is_none() {
            return;
        }
        match entry_type {
            EntryType::AddPeer => {
                tracing::info!(node = %self.shared.node_id, conf = %s.conf.conf, "add_peer committed");
            }
            EntryType::RemovePeer => {
                tracing::info!(node = %self.shared.node_id, conf = %s.conf.conf, "remove_peer committed");
                if !s.conf.conf.contains(&self.server_id()) {
                    // the leader removed itself
                    s.conf.conf.clear();
                    let term = s.current_term;
                    self.step_down(s, term);
                } else {
                    let old_peers = s.conf_change_ctx.clone().unwrap_or_default();
                    for peer in old_peers {
                        if !new_peers.contains(&peer) {
                            s.replicators.stop(&peer);
                        }
                    }
                }
            }
            _ => {}
        }
        s.conf_change_ctx = None;
    }

    // ===== timers =====

    pub(crate) fn arm_election_timer(&self, s: &mut NodeState) {
        let Some(engine) = s.engine.as_ref() else { return };
        let delay = random_timeout(engine.timings.election_timeout_ms);
        let node = self.clone();
        if let Some(timer) = s.timers.election.take() {
            timer.cancel();
        }
        s.timers.election = Some(Timer::schedule(delay, async move {
            node.handle_election_timeout().await;
        }));
    }

    fn arm_vote_timer(&self, s: &mut NodeState) {
        let Some(engine) = s.engine.as_ref() else { return };
        let delay = random_timeout((engine.timings.election_timeout_ms / 10).max(1));
        let node = self.clone();
        if let Some(timer) = s.timers.vote.take() {
            timer.cancel();
        }
        s.timers.vote = Some(Timer::schedule(delay, async move {
            node.handle_vote_timeout().await;
        }));
    }

    pub(crate) fn arm_stepdown_timer(&self, s: &mut NodeState) {
        let Some(engine) = s.engine.as_ref() else { return };
        let delay = engine.timings.election_timeout();
        let node = self.clone();
        if let Some(timer) = s.timers.step_down.take() {
            timer.cancel();
        }
        s.timers.step_down = Some(Timer::schedule(delay, async move {
            node.handle_stepdown_timeout().await;
        }));
    }

    pub(crate) fn arm_snapshot_timer(&self, s: &mut NodeState) {
        let Some(engine) = s.engine.as_ref() else { return };
        let delay = std::time::Duration::from_millis(engine.timings.snapshot_interval_ms);
        let node = self.clone();
        if let Some(timer) = s.timers.snapshot.take() {
            timer.cancel();
        }
        s.timers.snapshot = Some(Timer::schedule(delay, async move {
            node.handle_snapshot_timeout().await;
        }));
    }

    async fn handle_election_timeout(&self) {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role != Role::Follower {
            return;
        }
        let election_timeout = match s.engine.as_ref() {
            Some(engine) => engine.timings.election_timeout(),
            None => return,
        };
        if s.last_leader_timestamp.elapsed() < election_timeout {
            // leader contact since this timer was armed
            self.arm_election_timer(s);
            return;
        }
        self.elect_self(s);
    }

    async fn handle_vote_timeout(&self) {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role == Role::Candidate {
            tracing::info!(
                node = %self.shared.node_id,
                term = s.current_term,
                "vote timeout, retry election"
            );
            self.elect_self(s);
        }
    }

    /// Leader watchdog: step down once a quorum of peers has been silent
    /// for a full election timeout.
    async fn handle_stepdown_timeout(&self) {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role != Role::Leader {
            return;
        }
        let election_timeout = match s.engine.as_ref() {
            Some(engine) => engine.timings.election_timeout(),
            None => return,
        };
        let mut dead_count = 0usize;
        for peer in s.conf.conf.iter() {
            if *peer == self.server_id() {
                continue;
            }
            let alive = s
                .replicators
                .last_response(peer)
                .map(|t| t.elapsed() <= election_timeout)
                .unwrap_or(false);
            if !alive {
                dead_count += 1;
            }
        }
        if dead_count < s.conf.conf.quorum() {
            self.arm_stepdown_timer(s);
        } else {
            tracing::warn!(
                node = %self.shared.node_id,
                term = s.current_term,
                dead_count,
                "step down, quorum of peers is dead"
            );
            let term = s.current_term;
            self.step_down(s, term);
        }
    }

    async fn handle_snapshot_timeout(&self) {
        {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role == Role::Shutdown {
                return;
            }
            self.arm_snapshot_timer(s);
        }
        // periodic snapshots ignore transient refusals
        if let Err(e) = self.snapshot().await {
            tracing::debug!(node = %self.shared.node_id, error = %e, "periodic snapshot skipped");
        }
    }

    // ===== small helpers =====

    pub(crate) fn last_log_index_of(&self, s: &NodeState) -> LogIndex {
        s.engine
            .as_ref()
            .map(|e| e.log.last_log_index())
            .unwrap_or(0)
    }

    pub(crate) fn last_log_term_of(&self, s: &NodeState) -> Term {
        let Some(engine) = s.engine.as_ref() else {
            return 0;
        };
        let last = engine.log.last_log_index();
        if last >= engine.log.first_log_index() {
            engine.log.term_at(last).unwrap_or(0)
        } else {
            s.last_snapshot_term
        }
    }
}
