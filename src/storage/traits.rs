//! Storage abstractions for Raft persistent state.
//!
//! Three separate stores back a node: the entry log, the stable store for
//! `(term, voted_for)`, and the snapshot store. Implementations must be
//! durable before returning; all operations are synchronous and are driven
//! from dedicated worker tasks by the core.

use thiserror::Error;

use crate::core::snapshot::SnapshotMeta;
use crate::core::types::{LogEntry, LogIndex, PeerId, Term};

/// Errors surfaced by storage backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(String),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Persistent log of entries. The log may have a truncated prefix after
/// snapshot compaction; `load` reports the first retained index.
pub trait LogStorage: Send {
    /// Load the whole retained log: `(first_index, entries)`. A fresh store
    /// returns `(1, [])`.
    fn load(&mut self) -> Result<(LogIndex, Vec<LogEntry>), StorageError>;

    /// Append entries after the current tail.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Drop every entry with index < `first_index_kept`.
    fn truncate_prefix(&mut self, first_index_kept: LogIndex) -> Result<(), StorageError>;

    /// Drop every entry with index > `last_index_kept`.
    fn truncate_suffix(&mut self, last_index_kept: LogIndex) -> Result<(), StorageError>;
}

/// Stable store for the term and vote, written before answering RPCs.
pub trait StableStorage: Send {
    /// Load `(term, voted_for)`; a fresh store returns `(0, None)`.
    fn load(&mut self) -> Result<(Term, Option<PeerId>), StorageError>;

    fn set_term_and_voted_for(
        &mut self,
        term: Term,
        voted_for: Option<PeerId>,
    ) -> Result<(), StorageError>;

    fn set_voted_for(&mut self, voted_for: Option<PeerId>) -> Result<(), StorageError>;
}

/// Sink for one snapshot being produced or installed.
pub trait SnapshotWriter: Send {
    /// Append serialized state-machine bytes.
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Fetch the snapshot bytes published at `uri` (leader-supplied during
    /// InstallSnapshot) instead of writing them locally.
    fn copy_from(&mut self, uri: &str) -> Result<(), StorageError>;

    /// Commit the snapshot: once this returns the snapshot is the one
    /// `SnapshotStorage::open` serves.
    fn save_meta(&mut self) -> Result<(), StorageError>;

    /// Abandon without committing.
    fn discard(&mut self);
}

/// Source for reading the current snapshot.
pub trait SnapshotReader: Send {
    fn meta(&self) -> SnapshotMeta;

    fn data(&self) -> Result<Vec<u8>, StorageError>;

    /// Location other replicas can `copy_from`.
    fn uri(&self) -> String;
}

/// Factory for snapshot writers/readers at one storage location.
pub trait SnapshotStorage: Send {
    fn create(&mut self, meta: SnapshotMeta) -> Result<Box<dyn SnapshotWriter>, StorageError>;

    /// Open the latest committed snapshot, if any.
    fn open(&mut self) -> Result<Option<Box<dyn SnapshotReader>>, StorageError>;
}

/// A storage provider resolves URIs of one scheme into concrete stores.
pub trait StorageProvider: Send + Sync {
    fn create_log_storage(&self, uri: &str) -> Result<Box<dyn LogStorage>, StorageError>;

    fn create_stable_storage(&self, uri: &str) -> Result<Box<dyn StableStorage>, StorageError>;

    fn create_snapshot_storage(&self, uri: &str)
        -> Result<Box<dyn SnapshotStorage>, StorageError>;
}
