//! In-process network for tests: routes RPCs between registries by
//! endpoint, with per-link partition control.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::core::node::Node;
use crate::core::registry::NodeRegistry;
use crate::core::types::PeerId;
use crate::transport::traits::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftClient, RequestVoteRequest, RequestVoteResponse, TransportError,
};

/// A virtual network of registries, one per simulated process.
pub struct InMemoryNetwork {
    inner: Mutex<NetInner>,
}

struct NetInner {
    registries: HashMap<SocketAddr, Arc<NodeRegistry>>,
    blocked: HashSet<(SocketAddr, SocketAddr)>,
    next_port: u16,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<InMemoryNetwork> {
        Arc::new(InMemoryNetwork {
            inner: Mutex::new(NetInner {
                registries: HashMap::new(),
                blocked: HashSet::new(),
                next_port: 7001,
            }),
        })
    }

    /// Create a registry on the next synthetic endpoint.
    pub fn open(self: &Arc<Self>) -> Arc<NodeRegistry> {
        let addr = {
            let mut inner = self.inner.lock().unwrap();
            let port = inner.next_port;
            inner.next_port += 1;
            SocketAddr::from(([127, 0, 0, 1], port))
        };
        self.register(addr)
    }

    /// Create a registry bound to `addr` on this network.
    pub fn register(self: &Arc<Self>, addr: SocketAddr) -> Arc<NodeRegistry> {
        let registry = NodeRegistry::new();
        let client = Arc::new(InMemoryClient {
            net: self.clone(),
            from: addr,
        });
        registry
            .init_standalone(addr, client)
            .expect("fresh registry");
        self.inner
            .lock()
            .unwrap()
            .registries
            .insert(addr, registry.clone());
        registry
    }

    /// Drop traffic between `a` and `b`, both directions.
    pub fn block(&self, a: SocketAddr, b: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked.insert((a, b));
        inner.blocked.insert((b, a));
    }

    pub fn unblock(&self, a: SocketAddr, b: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocked.remove(&(a, b));
        inner.blocked.remove(&(b, a));
    }

    /// Partition `addr` away from every other endpoint.
    pub fn isolate(&self, addr: SocketAddr) {
        let mut inner = self.inner.lock().unwrap();
        let others: Vec<SocketAddr> = inner
            .registries
            .keys()
            .copied()
            .filter(|a| *a != addr)
            .collect();
        for other in others {
            inner.blocked.insert((addr, other));
            inner.blocked.insert((other, addr));
        }
    }

    /// Remove every partition.
    pub fn heal(&self) {
        self.inner.lock().unwrap().blocked.clear();
    }

    fn route(&self, from: SocketAddr, target: &PeerId, group: &str) -> Result<Node, TransportError> {
        let inner = self.inner.lock().unwrap();
        if inner.blocked.contains(&(from, target.addr)) {
            return Err(TransportError::Timeout);
        }
        let registry = inner
            .registries
            .get(&target.addr)
            .ok_or(TransportError::NodeNotFound)?;
        registry
            .get(group, target)
            .ok_or(TransportError::NodeNotFound)
    }
}

struct InMemoryClient {
    net: Arc<InMemoryNetwork>,
    from: SocketAddr,
}

#[async_trait]
impl RaftClient for InMemoryClient {
    async fn request_vote(
        &self,
        target: PeerId,
        req: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, TransportError> {
        let node = self.net.route(self.from, &target, &req.group_id)?;
        node.handle_request_vote(req)
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }

    async fn append_entries(
        &self,
        target: PeerId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let node = self.net.route(self.from, &target, &req.group_id)?;
        node.handle_append_entries(req)
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }

    async fn install_snapshot(
        &self,
        target: PeerId,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, TransportError> {
        let node = self.net.route(self.from, &target, &req.group_id)?;
        node.handle_install_snapshot(req)
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}
