//! Process-wide node registry and RPC server lifecycle.
//!
//! The registry owns the bound address every local replica shares, the
//! outgoing RPC client, and the (group, peer) -> node table incoming RPCs
//! are dispatched through. A default instance exists for production use;
//! tests inject their own so in-process clusters stay isolated.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::core::error::RaftError;
use crate::core::node::Node;
use crate::core::types::{NodeId, PeerId};
use crate::transport::traits::RaftClient;

pub struct NodeRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    address: Option<SocketAddr>,
    client: Option<Arc<dyn RaftClient>>,
    nodes: HashMap<NodeId, Node>,
    server: Option<JoinHandle<()>>,
}

impl NodeRegistry {
    pub fn new() -> Arc<NodeRegistry> {
        Arc::new(NodeRegistry {
            inner: Mutex::new(RegistryInner {
                address: None,
                client: None,
                nodes: HashMap::new(),
                server: None,
            }),
        })
    }

    /// The process-default registry.
    pub fn global() -> Arc<NodeRegistry> {
        static GLOBAL: OnceLock<Arc<NodeRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(NodeRegistry::new).clone()
    }

    /// Bind the first free port in `ports`, start the HTTP Raft service on
    /// it and set up the outgoing client. May be called once.
    pub async fn init(
        self: &Arc<Self>,
        ip: IpAddr,
        ports: RangeInclusive<u16>,
    ) -> Result<SocketAddr, RaftError> {
        if self.inner.lock().unwrap().address.is_some() {
            return Err(RaftError::invalid("raft server already initialized"));
        }

        let mut listener = None;
        for port in ports {
            match tokio::net::TcpListener::bind((ip, port)).await {
                Ok(l) => {
                    listener = Some(l);
                    break;
                }
                Err(_) => continue,
            }
        }
        let listener =
            listener.ok_or_else(|| RaftError::Io("no free port in range".into()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| RaftError::Io(e.to_string()))?;

        let router = crate::transport::http::raft_router(self.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "raft server stopped");
            }
        });

        let mut inner = self.inner.lock().unwrap();
        inner.address = Some(addr);
        inner.client = Some(Arc::new(crate::transport::http::HttpRaftClient::new(
            Duration::from_secs(5),
        )));
        inner.server = Some(server);
        tracing::info!(address = %addr, "raft server started");
        Ok(addr)
    }

    /// Adopt an address and client without starting a server; used by
    /// in-process transports.
    pub fn init_standalone(
        &self,
        addr: SocketAddr,
        client: Arc<dyn RaftClient>,
    ) -> Result<(), RaftError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.address.is_some() {
            return Err(RaftError::invalid("raft server already initialized"));
        }
        inner.address = Some(addr);
        inner.client = Some(client);
        Ok(())
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.inner.lock().unwrap().address
    }

    pub fn client(&self) -> Option<Arc<dyn RaftClient>> {
        self.inner.lock().unwrap().client.clone()
    }

    /// Insert if absent. Returns false when the (group, peer) already has a
    /// registered node.
    pub fn add(&self, node: Node) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let node_id = node.node_id().clone();
        if inner.nodes.contains_key(&node_id) {
            return false;
        }
        inner.nodes.insert(node_id, node);
        true
    }

    pub fn remove(&self, node_id: &NodeId) {
        self.inner.lock().unwrap().nodes.remove(node_id);
    }

    pub fn get(&self, group_id: &str, peer_id: &PeerId) -> Option<Node> {
        let node_id = NodeId::new(group_id.to_string(), *peer_id);
        self.inner.lock().unwrap().nodes.get(&node_id).cloned()
    }

    /// Stop the RPC server. Registered nodes must be shut down separately.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(server) = inner.server.take() {
            server.abort();
        }
    }
}
