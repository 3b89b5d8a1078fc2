//! graft - a multi-group Raft consensus core for replicated state
//! machines.
//!
//! Each [`core::node::Node`] drives one replica of one replication group:
//! leader election, log replication, quorum commit and snapshot
//! coordination. Applications plug in a
//! [`state_machine::StateMachine`], pick storage through URIs resolved by
//! the [`storage`] provider registry, and host any number of nodes behind
//! one process-wide [`core::registry::NodeRegistry`].

pub mod core;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// In-process cluster harness for integration tests.
pub mod testing;

pub use crate::core::config::NodeOptions;
pub use crate::core::configuration::Configuration;
pub use crate::core::error::RaftError;
pub use crate::core::node::{Node, NodeStatus};
pub use crate::core::registry::NodeRegistry;
pub use crate::core::types::{EntryType, GroupId, LogEntry, NodeId, PeerId, Role};
