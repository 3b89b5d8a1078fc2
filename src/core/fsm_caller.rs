//! The applier: a dedicated task driving the user state machine.
//!
//! Committed entries, snapshot work and leadership hooks all funnel
//! through one ordered queue, so the state machine observes everything in
//! log order without ever running under the node mutex.

use tokio::sync::{mpsc, oneshot};

use crate::core::commit::CommitDone;
use crate::core::error::RaftError;
use crate::core::node::Node;
use crate::core::types::{EntryType, LogEntry, LogIndex, Term};
use crate::state_machine::StateMachine;

pub(crate) enum ApplyTask {
    /// A newly committed range, in order, plus the completions of the
    /// leader-local operations inside it.
    Committed {
        entries: Vec<LogEntry>,
        dones: Vec<(LogIndex, CommitDone)>,
    },
    /// Serialize the state machine into a fresh snapshot writer.
    SnapshotSave {
        done: oneshot::Sender<Result<(), RaftError>>,
    },
    /// Load the snapshot currently committed in snapshot storage (startup
    /// replay is done inline during init; this is the install path).
    SnapshotLoad {
        done: oneshot::Sender<Result<(), RaftError>>,
    },
    LeaderStop,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

pub(crate) fn spawn(
    node: Node,
    fsm: Box<dyn StateMachine>,
    last_applied_index: LogIndex,
    last_applied_term: Term,
) -> mpsc::UnboundedSender<ApplyTask> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(node, fsm, last_applied_index, last_applied_term, rx));
    tx
}

async fn run(
    node: Node,
    mut fsm: Box<dyn StateMachine>,
    mut last_applied_index: LogIndex,
    mut last_applied_term: Term,
    mut rx: mpsc::UnboundedReceiver<ApplyTask>,
) {
    while let Some(task) = rx.recv().await {
        match task {
            ApplyTask::Committed { entries, dones } => {
                let mut dones = dones.into_iter().peekable();
                for entry in entries {
                    if entry.index <= last_applied_index {
                        continue;
                    }
                    match entry.entry_type {
                        EntryType::Data => fsm.on_apply(&entry),
                        EntryType::AddPeer | EntryType::RemovePeer => {
                            node.on_configuration_change_done(
                                entry.entry_type,
                                entry.peers.clone().unwrap_or_default(),
                            )
                            .await;
                        }
                        EntryType::Unknown => {}
                    }
                    last_applied_index = entry.index;
                    last_applied_term = entry.term;

                    while dones.peek().map(|(i, _)| *i == entry.index).unwrap_or(false) {
                        let (_, done) = dones.next().expect("peeked");
                        match done {
                            CommitDone::Reply(tx) => {
                                let _ = tx.send(Ok(()));
                            }
                            CommitDone::LeaderStart => fsm.on_leader_start(),
                        }
                    }
                }
                // Completions for entries the state machine already holds
                // (e.g. subsumed by a snapshot) succeed immediately.
                for (_, done) in dones {
                    match done {
                        CommitDone::Reply(tx) => {
                            let _ = tx.send(Ok(()));
                        }
                        CommitDone::LeaderStart => fsm.on_leader_start(),
                    }
                }
            }
            ApplyTask::SnapshotSave { done } => {
                let result =
                    save_snapshot(&node, fsm.as_mut(), last_applied_index, last_applied_term)
                        .await;
                let _ = done.send(result);
            }
            ApplyTask::SnapshotLoad { done } => {
                let result = load_snapshot(&node, fsm.as_mut()).await;
                if let Ok((index, term)) = &result {
                    last_applied_index = *index;
                    last_applied_term = *term;
                }
                let _ = done.send(result.map(|_| ()));
            }
            ApplyTask::LeaderStop => fsm.on_leader_stop(),
            ApplyTask::Shutdown { done } => {
                let _ = done.send(());
                break;
            }
        }
    }
}

async fn save_snapshot(
    node: &Node,
    fsm: &mut dyn StateMachine,
    last_applied_index: LogIndex,
    last_applied_term: Term,
) -> Result<(), RaftError> {
    let meta = node
        .build_snapshot_meta(last_applied_index, last_applied_term)
        .await;
    let mut writer = match node.create_snapshot_writer(meta.clone()).await {
        Ok(w) => w,
        Err(e) => {
            node.abort_snapshot_save().await;
            return Err(e);
        }
    };
    let fsm_result = fsm.on_snapshot_save(writer.as_mut());
    node.on_snapshot_save_done(meta, writer, fsm_result).await
}

async fn load_snapshot(
    node: &Node,
    fsm: &mut dyn StateMachine,
) -> Result<(LogIndex, Term), RaftError> {
    let mut reader = match node.open_snapshot_reader().await {
        Ok(Some(r)) => r,
        Ok(None) => {
            node.abort_snapshot_load().await;
            return Err(RaftError::Io("snapshot storage is empty".into()));
        }
        Err(e) => {
            node.abort_snapshot_load().await;
            return Err(e);
        }
    };
    if let Err(e) = fsm.on_snapshot_load(reader.as_mut()) {
        node.abort_snapshot_load().await;
        return Err(e);
    }
    let meta = reader.meta();
    node.on_snapshot_load_done().await;
    Ok((meta.last_included_index, meta.last_included_term))
}
