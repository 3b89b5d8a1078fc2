//! Peer sets and the per-index configuration history.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::types::{LogIndex, PeerId};

/// An unordered set of peers forming one replication configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    peers: BTreeSet<PeerId>,
}

impl Configuration {
    pub fn new() -> Self {
        Configuration::default()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Majority size of this configuration.
    pub fn quorum(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn contains_all(&self, peers: &[PeerId]) -> bool {
        peers.iter().all(|p| self.peers.contains(p))
    }

    /// True when this configuration is exactly the given peer list.
    pub fn equals(&self, peers: &[PeerId]) -> bool {
        self.peers.len() == peers.len() && self.contains_all(peers)
    }

    /// Returns false when the peer was already present.
    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    /// Returns false when the peer was not present.
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    pub fn to_vec(&self) -> Vec<PeerId> {
        self.peers.iter().copied().collect()
    }
}

impl From<Vec<PeerId>> for Configuration {
    fn from(peers: Vec<PeerId>) -> Self {
        Configuration {
            peers: peers.into_iter().collect(),
        }
    }
}

impl FromIterator<PeerId> for Configuration {
    fn from_iter<I: IntoIterator<Item = PeerId>>(iter: I) -> Self {
        Configuration {
            peers: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, p) in self.peers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, "}}")
    }
}

/// A configuration together with the log index that introduced it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationPair {
    pub index: LogIndex,
    pub conf: Configuration,
}

impl ConfigurationPair {
    pub fn new(index: LogIndex, conf: Configuration) -> Self {
        ConfigurationPair { index, conf }
    }
}

/// Ordered history of configuration entries in the log plus a snapshot
/// anchor covering everything the log prefix no longer holds.
#[derive(Debug, Default)]
pub struct ConfigurationManager {
    configurations: Vec<(LogIndex, Configuration)>,
    snapshot: ConfigurationPair,
}

impl ConfigurationManager {
    pub fn new() -> Self {
        ConfigurationManager::default()
    }

    /// Record the configuration introduced at `index`. Indices must be
    /// strictly increasing.
    pub fn add(&mut self, index: LogIndex, conf: Configuration) {
        debug_assert!(
            self.configurations
                .last()
                .map(|(i, _)| *i < index)
                .unwrap_or(true),
            "configuration indices must be strictly increasing"
        );
        self.configurations.push((index, conf));
    }

    /// Drop entries below `first_index_kept` (log prefix truncated).
    pub fn truncate_prefix(&mut self, first_index_kept: LogIndex) {
        self.configurations.retain(|(i, _)| *i >= first_index_kept);
    }

    /// Drop entries above `last_index_kept` (follower conflict truncation).
    pub fn truncate_suffix(&mut self, last_index_kept: LogIndex) {
        self.configurations.retain(|(i, _)| *i <= last_index_kept);
    }

    /// Update the snapshot anchor and forget everything it subsumes.
    pub fn set_snapshot(&mut self, index: LogIndex, conf: Configuration) {
        self.snapshot = ConfigurationPair::new(index, conf);
        self.configurations.retain(|(i, _)| *i > index);
    }

    pub fn snapshot(&self) -> &ConfigurationPair {
        &self.snapshot
    }

    /// Latest configuration at or below `index`; falls back to the anchor.
    pub fn get(&self, index: LogIndex) -> ConfigurationPair {
        self.configurations
            .iter()
            .rev()
            .find(|(i, _)| *i <= index)
            .map(|(i, c)| ConfigurationPair::new(*i, c.clone()))
            .unwrap_or_else(|| self.snapshot.clone())
    }

    /// Latest known configuration overall.
    pub fn last(&self) -> ConfigurationPair {
        self.configurations
            .last()
            .map(|(i, c)| ConfigurationPair::new(*i, c.clone()))
            .unwrap_or_else(|| self.snapshot.clone())
    }
}
