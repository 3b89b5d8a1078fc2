//! Snapshot coordination: local save, leader-driven install, and the
//! shared load-done path that reconciles the log with a loaded snapshot.
//!
//! At most one of {save, install/load} is active at a time; the two flags
//! in [`SnapshotCoordinator`] arbitrate, and `snapshot()` refuses with
//! RETRY while either is set.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::configuration::Configuration;
use crate::core::error::RaftError;
use crate::core::fsm_caller::ApplyTask;
use crate::core::node::Node;
use crate::core::types::{LogIndex, Role, Term};
use crate::storage::traits::{SnapshotReader, SnapshotWriter};
use crate::transport::traits::{InstallSnapshotRequest, InstallSnapshotResponse};

/// Identity of a snapshot: the log position it replaces and the
/// configuration in effect there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub last_configuration: Configuration,
}

/// Mutual-exclusion flags for snapshot activity.
#[derive(Debug, Default)]
pub(crate) struct SnapshotCoordinator {
    pub saving: bool,
    pub loading: Option<SnapshotMeta>,
}

impl Node {
    /// Serialize a state-machine snapshot and compact the log prefix it
    /// covers. Refuses with RETRY while another save or a load/install is
    /// in flight, and with INVALID when snapshot storage is unconfigured.
    pub async fn snapshot(&self) -> Result<(), RaftError> {
        let has_storage = self.shared.snapshot_storage.lock().await.is_some();
        let rx = {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role == Role::Shutdown || s.engine.is_none() {
                return Err(RaftError::invalid("node is shut down"));
            }
            if !has_storage {
                return Err(RaftError::invalid("snapshot storage not configured"));
            }
            if s.snapshot_flags.loading.is_some() {
                return Err(RaftError::Retry("snapshot load/install in progress".into()));
            }
            if s.snapshot_flags.saving {
                return Err(RaftError::Retry("snapshot save in progress".into()));
            }
            s.snapshot_flags.saving = true;
            let (tx, rx) = oneshot::channel();
            let engine = s.engine.as_ref().expect("checked above");
            let _ = engine.fsm.send(ApplyTask::SnapshotSave { done: tx });
            rx
        };
        rx.await
            .map_err(|_| RaftError::invalid("node shut down during snapshot"))?
    }

    /// Leader-pushed snapshot install. Validates under the lock, copies the
    /// bundle off-lock through the file-transfer seam, then routes the load
    /// through the applier so it is ordered against entry application.
    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        let meta = {
            let mut guard = self.shared.state.lock().await;
            let s = &mut *guard;
            if s.role == Role::Shutdown || s.engine.is_none() {
                return Err(RaftError::invalid("node is shut down"));
            }
            if s.snapshot_flags.loading.is_some() {
                return Err(RaftError::Retry("snapshot install in progress".into()));
            }
            if req.term < s.current_term {
                tracing::warn!(
                    node = %self.shared.node_id,
                    from = %req.server_id,
                    term = req.term,
                    current_term = s.current_term,
                    "ignore stale InstallSnapshot"
                );
                return Ok(InstallSnapshotResponse {
                    term: s.current_term,
                    success: false,
                });
            }
            if req.term > s.current_term || s.role != Role::Follower {
                self.step_down(s, req.term);
            }
            if s.leader_id.is_none() {
                s.leader_id = Some(req.server_id);
            }

            // retried install of the snapshot we already hold
            if req.last_included_log_index == s.last_snapshot_index
                && req.last_included_log_term == s.last_snapshot_term
            {
                return Ok(InstallSnapshotResponse {
                    term: s.current_term,
                    success: true,
                });
            }

            assert!(
                req.last_included_log_index > s.last_snapshot_index,
                "InstallSnapshot must carry a newer snapshot"
            );
            assert!(
                req.last_included_log_index > self.last_log_index_of(s),
                "InstallSnapshot must reach beyond the local log"
            );

            let meta = SnapshotMeta {
                last_included_index: req.last_included_log_index,
                last_included_term: req.last_included_log_term,
                last_configuration: Configuration::from(req.peers.clone()),
            };
            s.snapshot_flags.loading = Some(meta.clone());
            tracing::info!(
                node = %self.shared.node_id,
                from = %req.server_id,
                last_included_index = meta.last_included_index,
                last_included_term = meta.last_included_term,
                uri = %req.uri,
                "installing snapshot"
            );
            meta
        };

        // fetch the bundle without holding the node mutex
        let copied = {
            let mut storage = self.shared.snapshot_storage.lock().await;
            match storage.as_mut() {
                None => Err(RaftError::invalid("snapshot storage not configured")),
                Some(st) => match st.create(meta.clone()) {
                    Err(e) => Err(RaftError::Io(e.to_string())),
                    Ok(mut writer) => {
                        let result = writer
                            .copy_from(&req.uri)
                            .and_then(|_| writer.save_meta())
                            .map_err(|e| RaftError::Io(e.to_string()));
                        if result.is_err() {
                            writer.discard();
                        }
                        result
                    }
                },
            }
        };
        if let Err(e) = copied {
            tracing::warn!(node = %self.shared.node_id, error = %e, uri = %req.uri, "snapshot copy failed");
            self.abort_snapshot_load().await;
            return Err(e);
        }

        let (tx, rx) = oneshot::channel();
        {
            let guard = self.shared.state.lock().await;
            match guard.engine.as_ref() {
                Some(engine) => {
                    let _ = engine.fsm.send(ApplyTask::SnapshotLoad { done: tx });
                }
                None => return Err(RaftError::invalid("node is shut down")),
            }
        }
        match rx.await {
            Ok(Ok(())) => {
                let term = self.shared.state.lock().await.current_term;
                Ok(InstallSnapshotResponse {
                    term,
                    success: true,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RaftError::invalid("node shut down during install")),
        }
    }

    // ===== applier-driven steps =====

    pub(crate) async fn build_snapshot_meta(
        &self,
        last_applied_index: LogIndex,
        last_applied_term: Term,
    ) -> SnapshotMeta {
        let guard = self.shared.state.lock().await;
        let mut conf = guard
            .engine
            .as_ref()
            .map(|e| e.log.configuration_at(last_applied_index).conf)
            .unwrap_or_default();
        if conf.is_empty() {
            conf = guard.conf.conf.clone();
        }
        SnapshotMeta {
            last_included_index: last_applied_index,
            last_included_term: last_applied_term,
            last_configuration: conf,
        }
    }

    pub(crate) async fn create_snapshot_writer(
        &self,
        meta: SnapshotMeta,
    ) -> Result<Box<dyn SnapshotWriter>, RaftError> {
        let mut storage = self.shared.snapshot_storage.lock().await;
        let st = storage
            .as_mut()
            .ok_or_else(|| RaftError::invalid("snapshot storage not configured"))?;
        st.create(meta).map_err(|e| RaftError::Io(e.to_string()))
    }

    pub(crate) async fn open_snapshot_reader(
        &self,
    ) -> Result<Option<Box<dyn SnapshotReader>>, RaftError> {
        let mut storage = self.shared.snapshot_storage.lock().await;
        let st = storage
            .as_mut()
            .ok_or_else(|| RaftError::invalid("snapshot storage not configured"))?;
        st.open().map_err(|e| RaftError::Io(e.to_string()))
    }

    pub(crate) async fn abort_snapshot_save(&self) {
        self.shared.state.lock().await.snapshot_flags.saving = false;
    }

    pub(crate) async fn abort_snapshot_load(&self) {
        self.shared.state.lock().await.snapshot_flags.loading = None;
    }

    /// Finish a local save: reject snapshots a concurrent install made
    /// stale, then adopt the new snapshot point and compact the log.
    pub(crate) async fn on_snapshot_save_done(
        &self,
        meta: SnapshotMeta,
        mut writer: Box<dyn SnapshotWriter>,
        fsm_result: Result<(), RaftError>,
    ) -> Result<(), RaftError> {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;

        if let Err(e) = fsm_result {
            writer.discard();
            s.snapshot_flags.saving = false;
            return Err(e);
        }
        if meta.last_included_index <= s.last_snapshot_index {
            tracing::warn!(
                node = %self.shared.node_id,
                last_included_index = meta.last_included_index,
                last_snapshot_index = s.last_snapshot_index,
                "discard saved snapshot, a newer one exists"
            );
            writer.discard();
            s.snapshot_flags.saving = false;
            return Err(RaftError::Stale("snapshot superseded by a newer install".into()));
        }

        s.last_snapshot_index = meta.last_included_index;
        s.last_snapshot_term = meta.last_included_term;
        if let Some(engine) = s.engine.as_mut() {
            engine
                .log
                .set_snapshot_configuration(meta.last_included_index, meta.last_configuration.clone());
            if engine.log.first_log_index() <= meta.last_included_index {
                engine.log.truncate_prefix(meta.last_included_index + 1);
            }
            engine.log.check_and_set_configuration(&mut s.conf);
        }
        let result = writer.save_meta().map_err(|e| RaftError::Io(e.to_string()));
        s.snapshot_flags.saving = false;
        if result.is_ok() {
            tracing::info!(
                node = %self.shared.node_id,
                last_included_index = meta.last_included_index,
                last_included_term = meta.last_included_term,
                "snapshot saved"
            );
        }
        result
    }

    /// Shared post-condition of startup load and install: adopt the
    /// snapshot point, discard or trim the log, install the snapshot's
    /// configuration and restart commit tracking after it.
    pub(crate) async fn on_snapshot_load_done(&self) {
        let mut guard = self.shared.state.lock().await;
        let s = &mut *guard;
        let Some(meta) = s.snapshot_flags.loading.clone() else {
            return;
        };
        s.last_snapshot_index = meta.last_included_index;
        s.last_snapshot_term = meta.last_included_term;
        if let Some(engine) = s.engine.as_mut() {
            Node::reconcile_log_with_snapshot(
                &mut engine.log,
                meta.last_included_index,
                meta.last_included_term,
            );
            engine
                .log
                .set_snapshot_configuration(meta.last_included_index, meta.last_configuration.clone());
            engine.log.check_and_set_configuration(&mut s.conf);
            // everything the snapshot covers is committed by definition;
            // commit tracking restarts after it (a node that won an
            // election mid-install keeps its own pending window)
            if s.role == Role::Follower {
                if let Some(batch) = engine
                    .commit
                    .set_last_committed_index(meta.last_included_index)
                {
                    Node::deliver_commit_batch(engine, batch);
                }
                engine
                    .commit
                    .reset_pending_index(meta.last_included_index + 1);
            }
        }
        s.snapshot_flags.loading = None;
        tracing::info!(
            node = %self.shared.node_id,
            last_included_index = meta.last_included_index,
            last_included_term = meta.last_included_term,
            "snapshot loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trips_through_json() {
        let meta = SnapshotMeta {
            last_included_index: 75,
            last_included_term: 4,
            last_configuration: vec![
                "127.0.0.1:7001:0".parse().unwrap(),
                "127.0.0.1:7002:0".parse().unwrap(),
            ]
            .into(),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: SnapshotMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn coordinator_defaults_to_idle() {
        let c = SnapshotCoordinator::default();
        assert!(!c.saving);
        assert!(c.loading.is_none());
    }
}
