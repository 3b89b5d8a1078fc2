//! Node initialization options and timing helpers.

use std::time::Duration;

use crate::core::configuration::Configuration;
use crate::state_machine::StateMachine;

/// Options for [`Node::init`](crate::core::node::Node::init).
///
/// Snapshotting is disabled iff `snapshot_uri` is empty.
pub struct NodeOptions {
    pub log_uri: String,
    pub stable_uri: String,
    pub snapshot_uri: String,
    /// Initial configuration, used only when the log is empty.
    pub initial_conf: Configuration,
    pub election_timeout_ms: u64,
    pub snapshot_interval_ms: u64,
    /// "Close enough" margin for new-peer catch-up, in log entries.
    pub catchup_margin: u64,
    /// Upper bound on in-flight pending applications on the leader.
    pub max_pending_applications: usize,
    pub fsm: Option<Box<dyn StateMachine>>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            log_uri: String::new(),
            stable_uri: String::new(),
            snapshot_uri: String::new(),
            initial_conf: Configuration::new(),
            election_timeout_ms: 1000,
            snapshot_interval_ms: 3_600_000,
            catchup_margin: 1000,
            max_pending_applications: 1000,
            fsm: None,
        }
    }
}

impl NodeOptions {
    pub fn with_election_timeout_ms(mut self, ms: u64) -> Self {
        self.election_timeout_ms = ms;
        self
    }

    pub fn with_snapshot_interval_ms(mut self, ms: u64) -> Self {
        self.snapshot_interval_ms = ms;
        self
    }

    pub fn with_fsm(mut self, fsm: Box<dyn StateMachine>) -> Self {
        self.fsm = Some(fsm);
        self
    }
}

/// Timing knobs the node keeps after init (everything in `NodeOptions`
/// that outlives initialization).
#[derive(Debug, Clone)]
pub(crate) struct NodeTimings {
    pub election_timeout_ms: u64,
    pub snapshot_interval_ms: u64,
    pub snapshot_uri: String,
    pub catchup_margin: u64,
}

impl NodeTimings {
    /// Replicator heartbeat period.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis((self.election_timeout_ms / 10).max(10))
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }
}

/// A randomized delay in `[base, 2 * base)` milliseconds.
pub(crate) fn random_timeout(base_ms: u64) -> Duration {
    use rand::Rng;
    let base = base_ms.max(1);
    let jitter = rand::rng().random_range(0..base);
    Duration::from_millis(base + jitter)
}
