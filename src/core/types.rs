//! Identifiers and log entry types shared across the crate.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::error::RaftError;

/// Opaque identifier of a replication group.
pub type GroupId = String;

/// Monotonically non-decreasing logical epoch. 0 means "no term yet".
pub type Term = u64;

/// 1-based log position. Index 0 is reserved/empty.
pub type LogIndex = u64;

/// Network endpoint plus replica ordinal. Printed as `ip:port:index`,
/// which is also the wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId {
    pub addr: SocketAddr,
    pub idx: u32,
}

impl PeerId {
    pub fn new(addr: SocketAddr, idx: u32) -> Self {
        PeerId { addr, idx }
    }

    /// The "no peer" value: an unbound endpoint.
    pub fn empty() -> Self {
        PeerId {
            addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            idx: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.addr.port() == 0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.idx)
    }
}

impl FromStr for PeerId {
    type Err = RaftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, idx) = s
            .rsplit_once(':')
            .ok_or_else(|| RaftError::invalid(format!("bad peer id: {s}")))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| RaftError::invalid(format!("bad peer address: {s}")))?;
        let idx: u32 = idx
            .parse()
            .map_err(|_| RaftError::invalid(format!("bad peer index: {s}")))?;
        Ok(PeerId { addr, idx })
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// (group, peer) pair, unique within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub group_id: GroupId,
    pub peer_id: PeerId,
}

impl NodeId {
    pub fn new(group_id: GroupId, peer_id: PeerId) -> Self {
        NodeId { group_id, peer_id }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.peer_id)
    }
}

/// Node role. Starts and ends in `Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Shutdown,
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Shutdown => write!(f, "shutdown"),
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Log entry kind. Wire values: UNKNOWN=0, DATA=1, ADD_PEER=2, REMOVE_PEER=3.
/// Unrecognized wire values decode to `Unknown` and are dropped by followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Unknown,
    Data,
    AddPeer,
    RemovePeer,
}

impl EntryType {
    pub fn to_wire(self) -> u32 {
        match self {
            EntryType::Unknown => 0,
            EntryType::Data => 1,
            EntryType::AddPeer => 2,
            EntryType::RemovePeer => 3,
        }
    }

    pub fn from_wire(v: u32) -> Self {
        match v {
            1 => EntryType::Data,
            2 => EntryType::AddPeer,
            3 => EntryType::RemovePeer,
            _ => EntryType::Unknown,
        }
    }

    pub fn is_configuration(self) -> bool {
        matches!(self, EntryType::AddPeer | EntryType::RemovePeer)
    }
}

impl Serialize for EntryType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for EntryType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u32::deserialize(deserializer)?;
        Ok(EntryType::from_wire(v))
    }
}

/// A single replicated log entry. For `Data` entries the payload is opaque
/// bytes; for configuration entries `peers` carries the resulting peer set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub entry_type: EntryType,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub peers: Option<Vec<PeerId>>,
}

impl LogEntry {
    pub fn data(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        LogEntry {
            term,
            index,
            entry_type: EntryType::Data,
            data,
            peers: None,
        }
    }

    pub fn configuration(
        term: Term,
        index: LogIndex,
        entry_type: EntryType,
        peers: Vec<PeerId>,
    ) -> Self {
        LogEntry {
            term,
            index,
            entry_type,
            data: Vec::new(),
            peers: Some(peers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16, idx: u32) -> PeerId {
        PeerId::new(SocketAddr::from(([127, 0, 0, 1], port)), idx)
    }

    #[test]
    fn peer_id_display_parse_round_trip() {
        let p = peer(8001, 2);
        assert_eq!(p.to_string(), "127.0.0.1:8001:2");
        let parsed: PeerId = "127.0.0.1:8001:2".parse().unwrap();
        assert_eq!(parsed, p);
    }

    #[test]
    fn peer_id_rejects_garbage() {
        assert!("not-a-peer".parse::<PeerId>().is_err());
        assert!("127.0.0.1:8001".parse::<PeerId>().is_err());
        assert!("127.0.0.1:8001:x".parse::<PeerId>().is_err());
    }

    #[test]
    fn empty_peer_id() {
        assert!(PeerId::empty().is_empty());
        assert!(!peer(8001, 0).is_empty());
    }

    #[test]
    fn peer_ids_are_totally_ordered() {
        let mut peers = vec![peer(8003, 0), peer(8001, 1), peer(8001, 0)];
        peers.sort();
        assert_eq!(peers, vec![peer(8001, 0), peer(8001, 1), peer(8003, 0)]);
    }

    #[test]
    fn entry_type_wire_values() {
        assert_eq!(EntryType::Unknown.to_wire(), 0);
        assert_eq!(EntryType::Data.to_wire(), 1);
        assert_eq!(EntryType::AddPeer.to_wire(), 2);
        assert_eq!(EntryType::RemovePeer.to_wire(), 3);
        // unknown values fold to Unknown
        assert_eq!(EntryType::from_wire(42), EntryType::Unknown);
    }

    #[test]
    fn peer_id_serializes_as_string() {
        let p = peer(8001, 0);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"127.0.0.1:8001:0\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
