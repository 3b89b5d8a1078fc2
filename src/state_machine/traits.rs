//! User state machine interface.
//!
//! The state machine is the application the group replicates. Committed
//! DATA entries reach it through `on_apply` in log order on every replica;
//! implementations must be deterministic.

use std::sync::{Arc, Mutex};

use crate::core::error::RaftError;
use crate::core::types::LogEntry;
use crate::storage::traits::{SnapshotReader, SnapshotWriter};

pub trait StateMachine: Send + 'static {
    /// A committed DATA entry. Called in strictly increasing index order.
    fn on_apply(&mut self, entry: &LogEntry);

    /// Serialize the current state into `writer`. The core commits the
    /// writer afterwards; returning an error abandons the snapshot.
    fn on_snapshot_save(&mut self, writer: &mut dyn SnapshotWriter) -> Result<(), RaftError>;

    /// Replace the current state with the snapshot in `reader`.
    fn on_snapshot_load(&mut self, reader: &mut dyn SnapshotReader) -> Result<(), RaftError>;

    /// The local node became leader and its first entry of the term
    /// committed.
    fn on_leader_start(&mut self) {}

    /// The local node lost or gave up leadership.
    fn on_leader_stop(&mut self) {}
}

/// Shared view of everything a [`TestStateMachine`] applied.
pub type AppliedLog = Arc<Mutex<Vec<Vec<u8>>>>;

/// Test state machine recording applied payloads into a shared vec, with
/// JSON snapshots so install/load paths are exercisable.
pub struct TestStateMachine {
    applied: AppliedLog,
    leader_starts: Arc<Mutex<usize>>,
}

impl TestStateMachine {
    pub fn new() -> Self {
        TestStateMachine {
            applied: Arc::new(Mutex::new(Vec::new())),
            leader_starts: Arc::new(Mutex::new(0)),
        }
    }

    /// Create with a shared vec so tests can inspect applied entries.
    pub fn with_shared(applied: AppliedLog) -> Self {
        TestStateMachine {
            applied,
            leader_starts: Arc::new(Mutex::new(0)),
        }
    }

    pub fn applied(&self) -> AppliedLog {
        self.applied.clone()
    }

    pub fn leader_starts(&self) -> Arc<Mutex<usize>> {
        self.leader_starts.clone()
    }
}

impl Default for TestStateMachine {
    fn default() -> Self {
        TestStateMachine::new()
    }
}

impl StateMachine for TestStateMachine {
    fn on_apply(&mut self, entry: &LogEntry) {
        self.applied.lock().unwrap().push(entry.data.clone());
    }

    fn on_snapshot_save(&mut self, writer: &mut dyn SnapshotWriter) -> Result<(), RaftError> {
        let applied = self.applied.lock().unwrap().clone();
        let bytes = serde_json::to_vec(&applied)
            .map_err(|e| RaftError::Io(format!("snapshot encode: {e}")))?;
        writer
            .write(&bytes)
            .map_err(|e| RaftError::Io(e.to_string()))
    }

    fn on_snapshot_load(&mut self, reader: &mut dyn SnapshotReader) -> Result<(), RaftError> {
        let bytes = reader.data().map_err(|e| RaftError::Io(e.to_string()))?;
        let applied: Vec<Vec<u8>> = serde_json::from_slice(&bytes)
            .map_err(|e| RaftError::Io(format!("snapshot decode: {e}")))?;
        *self.applied.lock().unwrap() = applied;
        Ok(())
    }

    fn on_leader_start(&mut self) {
        *self.leader_starts.lock().unwrap() += 1;
    }
}
