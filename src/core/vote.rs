//! Election vote tally.

use std::collections::BTreeSet;

use crate::core::types::PeerId;

/// Tracks grants for one election attempt. Reset at the start of each
/// attempt with the size of the configuration voting in it.
#[derive(Debug, Default)]
pub struct VoteContext {
    needed: usize,
    granted: BTreeSet<PeerId>,
}

impl VoteContext {
    pub fn new() -> Self {
        VoteContext::default()
    }

    /// Clear grants and size the quorum for `peer_count` voters.
    pub fn reset(&mut self, peer_count: usize) {
        self.needed = peer_count / 2 + 1;
        self.granted.clear();
    }

    /// Record a grant; duplicate grants from the same peer are idempotent.
    pub fn grant(&mut self, peer: PeerId) {
        self.granted.insert(peer);
    }

    pub fn granted(&self) -> usize {
        self.granted.len()
    }

    pub fn quorum(&self) -> bool {
        self.needed > 0 && self.granted.len() >= self.needed
    }
}
