//! Replication facade: per-peer replicator tasks driven by the leader.
//!
//! Each replicator owns the next/match bookkeeping for one peer, paces
//! itself at the heartbeat timeout, falls back to InstallSnapshot when the
//! peer is behind the compacted prefix, and feeds acks into quorum
//! accounting. The group is the thin API the node uses to start/stop them
//! and to await new-peer catch-up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::core::error::RaftError;
use crate::core::node::Node;
use crate::core::types::{EntryType, LogIndex, PeerId, Role, Term};
use crate::transport::traits::{
    AppendEntriesRequest, AppendEntriesResponse, EntryMeta, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftClient,
};

struct CatchupWaiter {
    margin: u64,
    deadline: Instant,
    tx: oneshot::Sender<Result<(), RaftError>>,
}

pub(crate) struct ReplicatorState {
    peer: PeerId,
    next_index: AtomicU64,
    match_index: AtomicU64,
    last_response: StdMutex<Option<Instant>>,
    wake: Notify,
    stopped: AtomicBool,
    waiter: StdMutex<Option<CatchupWaiter>>,
}

impl ReplicatorState {
    fn touch(&self) {
        *self.last_response.lock().unwrap() = Some(Instant::now());
    }

    fn satisfy_waiter(&self, leader_last: LogIndex) {
        let mut slot = self.waiter.lock().unwrap();
        let caught_up = slot
            .as_ref()
            .map(|w| self.match_index.load(Ordering::Acquire) + w.margin >= leader_last)
            .unwrap_or(false);
        if caught_up {
            if let Some(w) = slot.take() {
                let _ = w.tx.send(Ok(()));
            }
        }
    }

    fn check_deadline(&self) {
        let mut slot = self.waiter.lock().unwrap();
        let expired = slot
            .as_ref()
            .map(|w| Instant::now() >= w.deadline)
            .unwrap_or(false);
        if expired {
            if let Some(w) = slot.take() {
                let _ = w.tx.send(Err(RaftError::TimedOut("catch-up deadline".into())));
            }
        }
    }

    fn fail_waiter(&self, err: RaftError) {
        if let Some(w) = self.waiter.lock().unwrap().take() {
            let _ = w.tx.send(Err(err));
        }
    }
}

struct Replicator {
    shared: Arc<ReplicatorState>,
    task: JoinHandle<()>,
}

impl Replicator {
    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.fail_waiter(RaftError::invalid("replicator stopped"));
        self.shared.wake.notify_one();
        self.task.abort();
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) struct ReplicatorGroup {
    replicators: HashMap<PeerId, Replicator>,
    term: Term,
    heartbeat: Duration,
}

impl ReplicatorGroup {
    pub fn new() -> Self {
        ReplicatorGroup {
            replicators: HashMap::new(),
            term: 0,
            heartbeat: Duration::from_millis(100),
        }
    }

    /// Re-initialize for a new leadership term.
    pub fn reset(&mut self, term: Term, heartbeat: Duration) {
        self.stop_all();
        self.term = term;
        self.heartbeat = heartbeat;
    }

    pub fn start(
        &mut self,
        node: Node,
        client: Arc<dyn RaftClient>,
        peer: PeerId,
        next_index: LogIndex,
    ) {
        if self.replicators.contains_key(&peer) {
            return;
        }
        let shared = Arc::new(ReplicatorState {
            peer,
            next_index: AtomicU64::new(next_index),
            match_index: AtomicU64::new(0),
            last_response: StdMutex::new(None),
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            waiter: StdMutex::new(None),
        });
        let task = tokio::spawn(run_replicator(
            node,
            client,
            shared.clone(),
            self.term,
            self.heartbeat,
        ));
        self.replicators.insert(peer, Replicator { shared, task });
    }

    pub fn stop(&mut self, peer: &PeerId) {
        if let Some(replicator) = self.replicators.remove(peer) {
            replicator.stop();
        }
    }

    pub fn stop_all(&mut self) {
        for (_, replicator) in self.replicators.drain() {
            replicator.stop();
        }
    }

    /// Nudge every replicator: new entries are available.
    pub fn wake_all(&self) {
        for replicator in self.replicators.values() {
            replicator.shared.wake.notify_one();
        }
    }

    pub fn last_response(&self, peer: &PeerId) -> Option<Instant> {
        self.replicators
            .get(peer)
            .and_then(|r| *r.shared.last_response.lock().unwrap())
    }

    pub fn match_index(&self, peer: &PeerId) -> Option<LogIndex> {
        self.replicators
            .get(peer)
            .map(|r| r.shared.match_index.load(Ordering::Acquire))
    }

    /// Register a catch-up waiter: resolves Ok once the peer's match index
    /// is within `margin` entries of the leader's last log index, or with
    /// TIMED_OUT at `deadline`.
    pub fn wait_caughtup(
        &self,
        peer: PeerId,
        margin: u64,
        deadline: Instant,
    ) -> Result<oneshot::Receiver<Result<(), RaftError>>, RaftError> {
        let replicator = self
            .replicators
            .get(&peer)
            .ok_or_else(|| RaftError::invalid(format!("no replicator for {peer}")))?;
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = replicator.shared.waiter.lock().unwrap();
            if slot.is_some() {
                return Err(RaftError::invalid("catch-up wait already pending"));
            }
            *slot = Some(CatchupWaiter {
                margin,
                deadline,
                tx,
            });
        }
        replicator.shared.wake.notify_one();
        Ok(rx)
    }
}

enum ReplicationWork {
    Entries {
        req: AppendEntriesRequest,
        sent_last: LogIndex,
    },
    Snapshot {
        req: InstallSnapshotRequest,
    },
}

async fn run_replicator(
    node: Node,
    client: Arc<dyn RaftClient>,
    shared: Arc<ReplicatorState>,
    term: Term,
    heartbeat: Duration,
) {
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        shared.check_deadline();

        let Some(work) = node.prepare_replication(&shared, term).await else {
            break;
        };

        let mut immediate = false;
        match work {
            ReplicationWork::Entries { req, sent_last } => {
                match client.append_entries(shared.peer, req).await {
                    Ok(resp) => {
                        shared.touch();
                        immediate = node
                            .handle_append_entries_ack(&shared, term, sent_last, resp)
                            .await;
                    }
                    Err(e) => {
                        tracing::debug!(peer = %shared.peer, error = %e, "AppendEntries rpc failed");
                    }
                }
            }
            ReplicationWork::Snapshot { req } => {
                let snap_index = req.last_included_log_index;
                match client.install_snapshot(shared.peer, req).await {
                    Ok(resp) => {
                        shared.touch();
                        immediate = node
                            .handle_install_snapshot_ack(&shared, term, snap_index, resp)
                            .await;
                    }
                    Err(e) => {
                        tracing::debug!(peer = %shared.peer, error = %e, "InstallSnapshot rpc failed");
                    }
                }
            }
        }

        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        if !immediate {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(heartbeat) => {}
            }
        }
    }
}

impl Node {
    /// Build the next request for `peer` under the lock, or `None` when
    /// this node stopped leading the term the replicator serves.
    async fn prepare_replication(
        &self,
        shared: &ReplicatorState,
        term: Term,
    ) -> Option<ReplicationWork> {
        let guard = self.shared.state.lock().await;
        let s = &*guard;
        if s.role != Role::Leader || s.current_term != term {
            return None;
        }
        let engine = s.engine.as_ref()?;
        let next = shared.next_index.load(Ordering::Acquire).max(1);

        if next < engine.log.first_log_index() {
            // the peer needs entries our snapshot already subsumed
            let anchor = engine.log.snapshot_configuration();
            let peers = if anchor.conf.is_empty() {
                s.conf.conf.to_vec()
            } else {
                anchor.conf.to_vec()
            };
            let req = InstallSnapshotRequest {
                group_id: self.group_id().clone(),
                server_id: self.server_id(),
                peer_id: shared.peer,
                term,
                last_included_log_index: s.last_snapshot_index,
                last_included_log_term: s.last_snapshot_term,
                peers,
                uri: engine.timings.snapshot_uri.clone(),
            };
            return Some(ReplicationWork::Snapshot { req });
        }

        let leader_last = engine.log.last_log_index();
        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else if prev_log_index >= engine.log.first_log_index() {
            engine.log.term_at(prev_log_index).unwrap_or(0)
        } else {
            // prev sits exactly at the snapshot boundary
            s.last_snapshot_term
        };

        let entries = engine.log.entries_in(next, leader_last);
        let sent_last = entries.last().map(|e| e.index).unwrap_or(0);
        let mut metas = Vec::with_capacity(entries.len());
        let mut data = Vec::new();
        for entry in &entries {
            metas.push(EntryMeta {
                term: entry.term,
                entry_type: entry.entry_type.to_wire(),
                peers: entry.peers.clone().unwrap_or_default(),
                data_len: if entry.entry_type == EntryType::Data {
                    entry.data.len() as u64
                } else {
                    0
                },
            });
            if entry.entry_type == EntryType::Data {
                data.extend_from_slice(&entry.data);
            }
        }

        let req = AppendEntriesRequest {
            group_id: self.group_id().clone(),
            server_id: self.server_id(),
            peer_id: shared.peer,
            term,
            prev_log_index,
            prev_log_term,
            committed_index: engine.commit.last_committed_index(),
            entries: metas,
            data,
        };
        Some(ReplicationWork::Entries { req, sent_last })
    }

    /// Returns true when the replicator should send again immediately.
    async fn handle_append_entries_ack(
        &self,
        shared: &ReplicatorState,
        term: Term,
        sent_last: LogIndex,
        resp: AppendEntriesResponse,
    ) -> bool {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role != Role::Leader || s.current_term != term {
            return false;
        }
        if resp.term > s.current_term {
            tracing::info!(
                node = %self.shared.node_id,
                peer = %shared.peer,
                term = resp.term,
                "higher term in AppendEntries response, step down"
            );
            self.step_down(s, resp.term);
            return false;
        }

        if resp.success {
            if sent_last > 0 {
                if sent_last > shared.match_index.load(Ordering::Acquire) {
                    shared.match_index.store(sent_last, Ordering::Release);
                }
                shared.next_index.store(sent_last + 1, Ordering::Release);
                if let Some(engine) = s.engine.as_mut() {
                    if let Some(batch) = engine.commit.set_stable_at_peer(sent_last, shared.peer) {
                        Node::deliver_commit_batch(engine, batch);
                    }
                }
            }
            let leader_last = self.last_log_index_of(s);
            shared.satisfy_waiter(leader_last);
            shared.next_index.load(Ordering::Acquire) <= leader_last
        } else {
            // back off; the follower's last_log_index shortcuts the walk
            let next = shared.next_index.load(Ordering::Acquire);
            let backed_off = next
                .saturating_sub(1)
                .min(resp.last_log_index + 1)
                .max(1);
            shared.next_index.store(backed_off, Ordering::Release);
            backed_off < next
        }
    }

    async fn handle_install_snapshot_ack(
        &self,
        shared: &ReplicatorState,
        term: Term,
        snap_index: LogIndex,
        resp: InstallSnapshotResponse,
    ) -> bool {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        if s.role != Role::Leader || s.current_term != term {
            return false;
        }
        if resp.term > s.current_term {
            tracing::info!(
                node = %self.shared.node_id,
                peer = %shared.peer,
                term = resp.term,
                "higher term in InstallSnapshot response, step down"
            );
            self.step_down(s, resp.term);
            return false;
        }
        if !resp.success {
            return false;
        }
        tracing::info!(
            node = %self.shared.node_id,
            peer = %shared.peer,
            snap_index,
            "snapshot installed on peer"
        );
        shared.next_index.store(snap_index + 1, Ordering::Release);
        if snap_index > shared.match_index.load(Ordering::Acquire) {
            shared.match_index.store(snap_index, Ordering::Release);
        }
        shared.satisfy_waiter(self.last_log_index_of(s));
        true
    }
}
