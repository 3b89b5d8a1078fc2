//! Quorum tracking for pending log entries and commit-index advancement.

use std::collections::{BTreeSet, VecDeque};

use tokio::sync::oneshot;

use crate::core::configuration::Configuration;
use crate::core::error::RaftError;
use crate::core::types::{LogIndex, PeerId};

/// Completion attached to a pending entry. Delivered by the applier once
/// the entry is committed and applied, or failed early on leadership loss.
#[derive(Debug)]
pub enum CommitDone {
    /// Completes a caller awaiting `apply`/`add_peer`/`remove_peer`.
    Reply(oneshot::Sender<Result<(), RaftError>>),
    /// Fires the state machine's `on_leader_start` hook (the no-op anchor
    /// entry a fresh leader appends).
    LeaderStart,
}

impl CommitDone {
    /// Complete with an error without going through the applier.
    pub fn fail(self, err: RaftError) {
        if let CommitDone::Reply(tx) = self {
            let _ = tx.send(Err(err));
        }
    }
}

/// A newly committed range handed to the applier, with the completions of
/// the leader-local operations it contains.
#[derive(Debug)]
pub struct CommitBatch {
    pub from_index: LogIndex,
    pub to_index: LogIndex,
    pub dones: Vec<(LogIndex, CommitDone)>,
}

#[derive(Debug)]
struct PendingBallot {
    index: LogIndex,
    conf: Configuration,
    acks: BTreeSet<PeerId>,
    done: Option<CommitDone>,
}

impl PendingBallot {
    fn granted(&self) -> bool {
        self.acks.len() >= self.conf.quorum()
    }
}

/// Sliding window of ballots `[pending_index, pending_index + pending.len())`
/// on the leader; a plain monotonic committed index on followers.
#[derive(Debug)]
pub struct CommitManager {
    pending: VecDeque<PendingBallot>,
    pending_index: LogIndex,
    committed_index: LogIndex,
    max_pending: usize,
}

impl CommitManager {
    pub fn new(max_pending: usize, last_committed_index: LogIndex) -> Self {
        CommitManager {
            pending: VecDeque::new(),
            pending_index: last_committed_index + 1,
            committed_index: last_committed_index,
            max_pending,
        }
    }

    pub fn last_committed_index(&self) -> LogIndex {
        self.committed_index
    }

    pub fn pending_index(&self) -> LogIndex {
        self.pending_index
    }

    /// Discard all pending ballots and restart the window at `index`.
    /// Used on leadership change and after snapshot install/load. The
    /// committed index is untouched: a fresh leader's tail commits only
    /// once its own anchor entry reaches quorum.
    pub fn reset_pending_index(&mut self, index: LogIndex) {
        debug_assert!(self.pending.is_empty(), "pending ballots must be cleared first");
        self.pending.clear();
        self.pending_index = index;
    }

    /// Extend the window by one slot. `conf` is the configuration whose
    /// quorum judges the new entry.
    pub fn append_pending_application(
        &mut self,
        conf: Configuration,
        done: CommitDone,
    ) -> Result<(), RaftError> {
        if self.pending.len() >= self.max_pending {
            done.fail(RaftError::Retry("too many pending applications".into()));
            return Err(RaftError::Retry("too many pending applications".into()));
        }
        let index = self.pending_index + self.pending.len() as u64;
        self.pending.push_back(PendingBallot {
            index,
            conf,
            acks: BTreeSet::new(),
            done: Some(done),
        });
        Ok(())
    }

    /// Mark `peer` as having durably stored `index` and everything before
    /// it, then advance the committed index over every leading ballot whose
    /// ack set reaches its quorum. Idempotent; acks from peers outside a
    /// ballot's configuration are ignored for that ballot.
    pub fn set_stable_at_peer(&mut self, index: LogIndex, peer: PeerId) -> Option<CommitBatch> {
        for ballot in self.pending.iter_mut() {
            if ballot.index > index {
                break;
            }
            if ballot.conf.contains(&peer) {
                ballot.acks.insert(peer);
            }
        }
        self.advance()
    }

    /// Follower path: adopt the leader's committed index without quorum
    /// bookkeeping. Monotonic.
    pub fn set_last_committed_index(&mut self, index: LogIndex) -> Option<CommitBatch> {
        debug_assert!(self.pending.is_empty(), "follower has no pending ballots");
        if index <= self.committed_index {
            return None;
        }
        let from = self.committed_index + 1;
        self.committed_index = index;
        self.pending_index = index + 1;
        Some(CommitBatch {
            from_index: from,
            to_index: index,
            dones: Vec::new(),
        })
    }

    /// Fail every pending completion; invoked on leader step-down.
    pub fn clear_pending_applications(&mut self) {
        for mut ballot in self.pending.drain(..) {
            if let Some(done) = ballot.done.take() {
                done.fail(RaftError::NotPermitted("leadership lost".into()));
            }
        }
        self.pending_index = self.committed_index + 1;
    }

    fn advance(&mut self) -> Option<CommitBatch> {
        let from = self.committed_index + 1;
        let mut dones = Vec::new();
        while let Some(front) = self.pending.front() {
            if !front.granted() {
                break;
            }
            let mut ballot = self.pending.pop_front().expect("front exists");
            self.committed_index = ballot.index;
            self.pending_index = ballot.index + 1;
            if let Some(done) = ballot.done.take() {
                dones.push((ballot.index, done));
            }
        }
        if self.committed_index < from {
            return None;
        }
        Some(CommitBatch {
            from_index: from,
            to_index: self.committed_index,
            dones,
        })
    }
}
