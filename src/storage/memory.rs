//! In-process storage provider for tests and examples.
//!
//! State lives in process-global tables keyed by URI, so a node re-created
//! with the same URIs observes what its predecessor persisted. Snapshot
//! bundles are published in the same table, which lets `copy_from` ship
//! snapshot bytes between in-process replicas during InstallSnapshot.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::core::snapshot::SnapshotMeta;
use crate::core::types::{LogEntry, LogIndex, PeerId, Term};
use crate::storage::traits::{
    LogStorage, SnapshotReader, SnapshotStorage, SnapshotWriter, StableStorage, StorageError,
    StorageProvider,
};

#[derive(Debug, Default, Clone)]
struct LogRecord {
    first_index: LogIndex,
    entries: Vec<LogEntry>,
}

#[derive(Debug, Default, Clone)]
struct StableRecord {
    term: Term,
    voted_for: Option<PeerId>,
}

#[derive(Debug, Clone)]
struct SnapshotRecord {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

fn logs() -> &'static Mutex<HashMap<String, LogRecord>> {
    static LOGS: OnceLock<Mutex<HashMap<String, LogRecord>>> = OnceLock::new();
    LOGS.get_or_init(Default::default)
}

fn stables() -> &'static Mutex<HashMap<String, StableRecord>> {
    static STABLES: OnceLock<Mutex<HashMap<String, StableRecord>>> = OnceLock::new();
    STABLES.get_or_init(Default::default)
}

fn snapshots() -> &'static Mutex<HashMap<String, SnapshotRecord>> {
    static SNAPSHOTS: OnceLock<Mutex<HashMap<String, SnapshotRecord>>> = OnceLock::new();
    SNAPSHOTS.get_or_init(Default::default)
}

/// Provider for the `memory://` scheme.
pub struct MemoryProvider;

impl StorageProvider for MemoryProvider {
    fn create_log_storage(&self, uri: &str) -> Result<Box<dyn LogStorage>, StorageError> {
        Ok(Box::new(MemoryLogStorage { uri: uri.to_string() }))
    }

    fn create_stable_storage(&self, uri: &str) -> Result<Box<dyn StableStorage>, StorageError> {
        Ok(Box::new(MemoryStableStorage { uri: uri.to_string() }))
    }

    fn create_snapshot_storage(
        &self,
        uri: &str,
    ) -> Result<Box<dyn SnapshotStorage>, StorageError> {
        Ok(Box::new(MemorySnapshotStorage { uri: uri.to_string() }))
    }
}

pub struct MemoryLogStorage {
    uri: String,
}

impl LogStorage for MemoryLogStorage {
    fn load(&mut self) -> Result<(LogIndex, Vec<LogEntry>), StorageError> {
        let map = logs().lock().unwrap();
        match map.get(&self.uri) {
            Some(rec) => Ok((rec.first_index.max(1), rec.entries.clone())),
            None => Ok((1, Vec::new())),
        }
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut map = logs().lock().unwrap();
        let rec = map.entry(self.uri.clone()).or_insert_with(|| LogRecord {
            first_index: 1,
            entries: Vec::new(),
        });
        rec.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_prefix(&mut self, first_index_kept: LogIndex) -> Result<(), StorageError> {
        let mut map = logs().lock().unwrap();
        if let Some(rec) = map.get_mut(&self.uri) {
            rec.entries.retain(|e| e.index >= first_index_kept);
            rec.first_index = rec.first_index.max(first_index_kept);
        }
        Ok(())
    }

    fn truncate_suffix(&mut self, last_index_kept: LogIndex) -> Result<(), StorageError> {
        let mut map = logs().lock().unwrap();
        if let Some(rec) = map.get_mut(&self.uri) {
            rec.entries.retain(|e| e.index <= last_index_kept);
        }
        Ok(())
    }
}

pub struct MemoryStableStorage {
    uri: String,
}

impl StableStorage for MemoryStableStorage {
    fn load(&mut self) -> Result<(Term, Option<PeerId>), StorageError> {
        let map = stables().lock().unwrap();
        match map.get(&self.uri) {
            Some(rec) => Ok((rec.term, rec.voted_for)),
            None => Ok((0, None)),
        }
    }

    fn set_term_and_voted_for(
        &mut self,
        term: Term,
        voted_for: Option<PeerId>,
    ) -> Result<(), StorageError> {
        let mut map = stables().lock().unwrap();
        map.insert(self.uri.clone(), StableRecord { term, voted_for });
        Ok(())
    }

    fn set_voted_for(&mut self, voted_for: Option<PeerId>) -> Result<(), StorageError> {
        let mut map = stables().lock().unwrap();
        let rec = map.entry(self.uri.clone()).or_default();
        rec.voted_for = voted_for;
        Ok(())
    }
}

pub struct MemorySnapshotStorage {
    uri: String,
}

impl SnapshotStorage for MemorySnapshotStorage {
    fn create(&mut self, meta: SnapshotMeta) -> Result<Box<dyn SnapshotWriter>, StorageError> {
        Ok(Box::new(MemorySnapshotWriter {
            uri: self.uri.clone(),
            meta,
            buf: Vec::new(),
            discarded: false,
        }))
    }

    fn open(&mut self) -> Result<Option<Box<dyn SnapshotReader>>, StorageError> {
        let map = snapshots().lock().unwrap();
        Ok(map.get(&self.uri).map(|rec| {
            Box::new(MemorySnapshotReader {
                uri: self.uri.clone(),
                record: rec.clone(),
            }) as Box<dyn SnapshotReader>
        }))
    }
}

pub struct MemorySnapshotWriter {
    uri: String,
    meta: SnapshotMeta,
    buf: Vec<u8>,
    discarded: bool,
}

impl SnapshotWriter for MemorySnapshotWriter {
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn copy_from(&mut self, uri: &str) -> Result<(), StorageError> {
        let map = snapshots().lock().unwrap();
        let rec = map
            .get(uri)
            .ok_or_else(|| StorageError::NotFound(format!("no snapshot bundle at {uri}")))?;
        self.buf = rec.data.clone();
        Ok(())
    }

    fn save_meta(&mut self) -> Result<(), StorageError> {
        if self.discarded {
            return Err(StorageError::Io("writer already discarded".into()));
        }
        let mut map = snapshots().lock().unwrap();
        map.insert(
            self.uri.clone(),
            SnapshotRecord {
                meta: self.meta.clone(),
                data: std::mem::take(&mut self.buf),
            },
        );
        Ok(())
    }

    fn discard(&mut self) {
        self.discarded = true;
        self.buf.clear();
    }
}

pub struct MemorySnapshotReader {
    uri: String,
    record: SnapshotRecord,
}

impl SnapshotReader for MemorySnapshotReader {
    fn meta(&self) -> SnapshotMeta {
        self.record.meta.clone()
    }

    fn data(&self) -> Result<Vec<u8>, StorageError> {
        Ok(self.record.data.clone())
    }

    fn uri(&self) -> String {
        self.uri.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_state_survives_reopen() {
        let uri = "memory://stable-survives/stable";
        let peer: PeerId = "127.0.0.1:7001:0".parse().unwrap();
        {
            let mut s = MemoryProvider.create_stable_storage(uri).unwrap();
            s.set_term_and_voted_for(4, Some(peer)).unwrap();
        }
        let mut s = MemoryProvider.create_stable_storage(uri).unwrap();
        assert_eq!(s.load().unwrap(), (4, Some(peer)));
    }

    #[test]
    fn log_truncations() {
        let uri = "memory://log-truncations/log";
        let mut log = MemoryProvider.create_log_storage(uri).unwrap();
        let entries: Vec<LogEntry> = (1..=5).map(|i| LogEntry::data(1, i, vec![i as u8])).collect();
        log.append_entries(&entries).unwrap();

        log.truncate_suffix(4).unwrap();
        log.truncate_prefix(2).unwrap();

        let (first, kept) = log.load().unwrap();
        assert_eq!(first, 2);
        let indices: Vec<_> = kept.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![2, 3, 4]);
    }

    #[test]
    fn snapshot_copy_between_uris() {
        let src = "memory://copy-src/snapshot";
        let dst = "memory://copy-dst/snapshot";
        let meta = SnapshotMeta {
            last_included_index: 7,
            last_included_term: 2,
            last_configuration: Default::default(),
        };

        let mut store = MemoryProvider.create_snapshot_storage(src).unwrap();
        let mut w = store.create(meta.clone()).unwrap();
        w.write(b"snapshot-bytes").unwrap();
        w.save_meta().unwrap();

        let mut dst_store = MemoryProvider.create_snapshot_storage(dst).unwrap();
        let mut w = dst_store.create(meta.clone()).unwrap();
        w.copy_from(src).unwrap();
        w.save_meta().unwrap();

        let r = dst_store.open().unwrap().unwrap();
        assert_eq!(r.meta().last_included_index, 7);
        assert_eq!(r.data().unwrap(), b"snapshot-bytes");
    }

    #[test]
    fn discarded_writer_does_not_commit() {
        let uri = "memory://discard/snapshot";
        let meta = SnapshotMeta {
            last_included_index: 1,
            last_included_term: 1,
            last_configuration: Default::default(),
        };
        let mut store = MemoryProvider.create_snapshot_storage(uri).unwrap();
        let mut w = store.create(meta).unwrap();
        w.write(b"xyz").unwrap();
        w.discard();
        assert!(w.save_meta().is_err());
        assert!(store.open().unwrap().is_none());
    }
}
