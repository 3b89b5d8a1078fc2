//! In-process cluster harness built on the in-memory network.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::NodeOptions;
use crate::core::configuration::Configuration;
use crate::core::error::RaftError;
use crate::core::node::Node;
use crate::core::registry::NodeRegistry;
use crate::core::types::{PeerId, Role};
use crate::state_machine::{AppliedLog, TestStateMachine};
use crate::transport::inmemory::InMemoryNetwork;

fn unique_run_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Install a tracing subscriber honoring `RUST_LOG`; a no-op when one is
/// already set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct TestNode {
    pub node: Node,
    pub registry: Arc<NodeRegistry>,
    pub peer: PeerId,
    pub applied: AppliedLog,
    /// `memory://` prefix of this node's log/stable/snapshot stores.
    pub storage_prefix: String,
}

/// A cluster of in-process nodes in one replication group, each behind its
/// own registry so partitions behave like real processes.
pub struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    pub nodes: Vec<TestNode>,
    pub group: String,
    run: u64,
    election_timeout_ms: u64,
    snapshot_interval_ms: u64,
}

impl TestCluster {
    /// Start `count` voting members with the given election timeout.
    pub async fn start(name: &str, count: usize, election_timeout_ms: u64) -> TestCluster {
        Self::start_with_snapshots(name, count, election_timeout_ms, 0).await
    }

    /// As `start`, plus a periodic snapshot interval (0 disables the
    /// timer; snapshot storage is always configured).
    pub async fn start_with_snapshots(
        name: &str,
        count: usize,
        election_timeout_ms: u64,
        snapshot_interval_ms: u64,
    ) -> TestCluster {
        init_tracing();
        let mut cluster = TestCluster {
            network: InMemoryNetwork::new(),
            nodes: Vec::new(),
            group: name.to_string(),
            run: unique_run_id(),
            election_timeout_ms,
            snapshot_interval_ms,
        };

        let registries: Vec<Arc<NodeRegistry>> =
            (0..count).map(|_| cluster.network.open()).collect();
        let peers: Vec<PeerId> = registries
            .iter()
            .map(|r| PeerId::new(r.address().expect("registry has an address"), 0))
            .collect();
        let conf = Configuration::from(peers.clone());

        for registry in registries {
            cluster
                .spawn_node(registry, conf.clone())
                .await
                .expect("node init");
        }
        cluster
    }

    /// Add a node with an empty initial configuration: it idles as a
    /// follower until a leader replicates a configuration to it (the
    /// add_peer path).
    pub async fn start_spare(&mut self) -> usize {
        let registry = self.network.open();
        self.spawn_node(registry, Configuration::new())
            .await
            .expect("spare node init");
        self.nodes.len() - 1
    }

    async fn spawn_node(
        &mut self,
        registry: Arc<NodeRegistry>,
        conf: Configuration,
    ) -> Result<usize, RaftError> {
        let index = self.nodes.len();
        let node = Node::new(self.group.clone(), 0, registry.clone());
        let fsm = TestStateMachine::new();
        let applied = fsm.applied();
        let prefix = format!("memory://{}-{}/{}", self.group, self.run, index);
        let options = NodeOptions {
            log_uri: format!("{prefix}/log"),
            stable_uri: format!("{prefix}/stable"),
            snapshot_uri: format!("{prefix}/snapshot"),
            initial_conf: conf,
            election_timeout_ms: self.election_timeout_ms,
            snapshot_interval_ms: self.snapshot_interval_ms,
            fsm: Some(Box::new(fsm)),
            ..Default::default()
        };
        node.init(options).await?;
        self.nodes.push(TestNode {
            peer: node.server_id(),
            node,
            registry,
            applied,
            storage_prefix: prefix,
        });
        Ok(index)
    }

    pub fn snapshot_uri(&self, index: usize) -> String {
        format!("{}/snapshot", self.nodes[index].storage_prefix)
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index].node
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.nodes.iter().map(|n| n.peer).collect()
    }

    pub fn applied(&self, index: usize) -> Vec<Vec<u8>> {
        self.nodes[index].applied.lock().unwrap().clone()
    }

    /// Index of the current leader, if any node claims leadership.
    pub async fn leader_index(&self) -> Option<usize> {
        for (i, test_node) in self.nodes.iter().enumerate() {
            if test_node.node.role().await == Role::Leader {
                return Some(i);
            }
        }
        None
    }

    /// Poll until some node is leader.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(i) = self.leader_index().await {
                return Some(i);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until `predicate` holds or the timeout elapses.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&TestCluster) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if predicate(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub fn isolate(&self, index: usize) {
        self.network.isolate(self.nodes[index].peer.addr);
    }

    pub fn heal(&self) {
        self.network.heal();
    }

    pub async fn shutdown(self) {
        let shutdowns = self.nodes.iter().map(|n| n.node.shutdown());
        for result in futures::future::join_all(shutdowns).await {
            let _ = result;
        }
    }
}
