//! In-memory log tail over a `LogStorage`, with a dedicated disk worker.
//!
//! The node mutex is never held across a storage write: mutations update
//! the in-memory tail synchronously and queue the durable write to the
//! worker task, which acknowledges through a [`StableAck`].

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};

use crate::core::configuration::{Configuration, ConfigurationManager, ConfigurationPair};
use crate::core::node::Node;
use crate::core::types::{LogEntry, LogIndex, PeerId, Term};
use crate::storage::traits::{LogStorage, StorageError};

/// Who to notify once a batch of entries is durable.
pub(crate) enum StableAck {
    /// Leader-local append: route the ack into quorum accounting as the
    /// leader's own "peer" ack.
    Leader { node: Node, index: LogIndex },
    /// Follower append: completes the AppendEntries RPC in flight.
    Rpc(oneshot::Sender<Result<(), StorageError>>),
}

enum DiskCommand {
    Append {
        entries: Vec<LogEntry>,
        ack: StableAck,
    },
    TruncatePrefix(LogIndex),
    TruncateSuffix(LogIndex),
    Stop(oneshot::Sender<()>),
}

pub(crate) struct LogManager {
    first_index: LogIndex,
    entries: VecDeque<LogEntry>,
    config_manager: ConfigurationManager,
    disk: mpsc::UnboundedSender<DiskCommand>,
}

impl LogManager {
    /// Load the retained log from storage and start the disk worker.
    pub fn new(mut storage: Box<dyn LogStorage>) -> Result<Self, StorageError> {
        let (first_index, entries) = storage.load()?;
        let mut config_manager = ConfigurationManager::new();
        for entry in &entries {
            if entry.entry_type.is_configuration() {
                if let Some(peers) = &entry.peers {
                    config_manager.add(entry.index, Configuration::from(peers.clone()));
                }
            }
        }

        let (disk, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_disk_worker(storage, rx));

        Ok(LogManager {
            first_index,
            entries: entries.into(),
            config_manager,
            disk,
        })
    }

    pub fn first_log_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.first_index + self.entries.len() as u64 - 1
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index < self.first_index || index > self.last_log_index() {
            return None;
        }
        Some(self.entries[(index - self.first_index) as usize].term)
    }

    pub fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_log_index() {
            return None;
        }
        Some(&self.entries[(index - self.first_index) as usize])
    }

    /// Clone the entries in `[from, to]`, clamped to the retained range.
    pub fn entries_in(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        let from = from.max(self.first_index);
        let to = to.min(self.last_log_index());
        if from > to {
            return Vec::new();
        }
        (from..=to)
            .map(|i| self.entries[(i - self.first_index) as usize].clone())
            .collect()
    }

    /// Append entries to the tail and queue the durable write.
    pub fn append(&mut self, entries: Vec<LogEntry>, ack: StableAck) {
        for entry in &entries {
            if entry.entry_type.is_configuration() {
                if let Some(peers) = &entry.peers {
                    self.config_manager
                        .add(entry.index, Configuration::from(peers.clone()));
                }
            }
        }
        self.entries.extend(entries.iter().cloned());
        let _ = self.disk.send(DiskCommand::Append { entries, ack });
    }

    /// Drop every entry with index > `last_index_kept`.
    pub fn truncate_suffix(&mut self, last_index_kept: LogIndex) {
        while self
            .entries
            .back()
            .map(|e| e.index > last_index_kept)
            .unwrap_or(false)
        {
            self.entries.pop_back();
        }
        self.config_manager.truncate_suffix(last_index_kept);
        let _ = self.disk.send(DiskCommand::TruncateSuffix(last_index_kept));
    }

    /// Drop every entry with index < `first_index_kept`.
    pub fn truncate_prefix(&mut self, first_index_kept: LogIndex) {
        while self
            .entries
            .front()
            .map(|e| e.index < first_index_kept)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        self.first_index = self.first_index.max(first_index_kept);
        self.config_manager.truncate_prefix(first_index_kept);
        let _ = self.disk.send(DiskCommand::TruncatePrefix(first_index_kept));
    }

    /// Re-derive the effective configuration after an append or truncate.
    /// Updates `current` and reports whether it changed.
    pub fn check_and_set_configuration(&self, current: &mut ConfigurationPair) -> bool {
        let latest = self.config_manager.last();
        if latest.index == 0 && latest.conf.is_empty() {
            return false;
        }
        if latest.index != current.index {
            *current = latest;
            return true;
        }
        false
    }

    pub fn configuration_at(&self, index: LogIndex) -> ConfigurationPair {
        self.config_manager.get(index)
    }

    pub fn set_snapshot_configuration(&mut self, index: LogIndex, conf: Configuration) {
        self.config_manager.set_snapshot(index, conf);
    }

    pub fn snapshot_configuration(&self) -> ConfigurationPair {
        self.config_manager.snapshot().clone()
    }

    /// Stop the disk worker after it drains queued writes.
    pub fn shutdown(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.disk.send(DiskCommand::Stop(tx));
        rx
    }
}

async fn run_disk_worker(
    mut storage: Box<dyn LogStorage>,
    mut rx: mpsc::UnboundedReceiver<DiskCommand>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            DiskCommand::Append { entries, ack } => {
                let result = storage.append_entries(&entries);
                match ack {
                    StableAck::Leader { node, index } => match result {
                        Ok(()) => node.advance_commit_index(PeerId::empty(), index).await,
                        Err(e) => {
                            tracing::error!(index, error = %e, "leader log append failed");
                        }
                    },
                    StableAck::Rpc(tx) => {
                        let _ = tx.send(result);
                    }
                }
            }
            DiskCommand::TruncatePrefix(index) => {
                if let Err(e) = storage.truncate_prefix(index) {
                    tracing::error!(index, error = %e, "log truncate_prefix failed");
                }
            }
            DiskCommand::TruncateSuffix(index) => {
                if let Err(e) = storage.truncate_suffix(index) {
                    tracing::error!(index, error = %e, "log truncate_suffix failed");
                }
            }
            DiskCommand::Stop(tx) => {
                let _ = tx.send(());
                break;
            }
        }
    }
}
