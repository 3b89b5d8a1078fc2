//! RPC handler semantics exercised directly against a single quiet node
//! (election timeout set far out so timers never interfere).

use std::sync::Arc;
use std::time::Duration;

use graft::core::config::NodeOptions;
use graft::state_machine::{AppliedLog, TestStateMachine};
use graft::transport::inmemory::InMemoryNetwork;
use graft::transport::traits::{AppendEntriesRequest, EntryMeta, RequestVoteRequest};
use graft::{Configuration, Node, PeerId, RaftError, Role};

struct QuietNode {
    _network: Arc<InMemoryNetwork>,
    registry: Arc<graft::NodeRegistry>,
    node: Node,
    me: PeerId,
    b: PeerId,
    c: PeerId,
    applied: AppliedLog,
    group: String,
}

async fn quiet_node(name: &str) -> QuietNode {
    let network = InMemoryNetwork::new();
    let registry = network.open();
    // endpoints that are routable but never host a node
    let b = PeerId::new(network.open().address().unwrap(), 0);
    let c = PeerId::new(network.open().address().unwrap(), 0);

    let node = Node::new(name.to_string(), 0, registry.clone());
    let me = node.server_id();
    let fsm = TestStateMachine::new();
    let applied = fsm.applied();
    let options = NodeOptions {
        log_uri: format!("memory://{name}/log"),
        stable_uri: format!("memory://{name}/stable"),
        initial_conf: Configuration::from(vec![me, b, c]),
        election_timeout_ms: 600_000,
        fsm: Some(Box::new(fsm)),
        ..Default::default()
    };
    node.init(options).await.unwrap();
    QuietNode {
        _network: network,
        registry,
        node,
        me,
        b,
        c,
        applied,
        group: name.to_string(),
    }
}

fn vote_req(q: &QuietNode, candidate: PeerId, term: u64, last_index: u64, last_term: u64) -> RequestVoteRequest {
    RequestVoteRequest {
        group_id: q.group.clone(),
        server_id: candidate,
        peer_id: q.me,
        term,
        last_log_index: last_index,
        last_log_term: last_term,
    }
}

fn append_req(
    q: &QuietNode,
    leader: PeerId,
    term: u64,
    prev: (u64, u64),
    entries: Vec<EntryMeta>,
    data: Vec<u8>,
    committed: u64,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        group_id: q.group.clone(),
        server_id: leader,
        peer_id: q.me,
        term,
        prev_log_index: prev.0,
        prev_log_term: prev.1,
        committed_index: committed,
        entries,
        data,
    }
}

fn data_meta(term: u64, payload: &[u8]) -> EntryMeta {
    EntryMeta {
        term,
        entry_type: 1, // DATA
        peers: vec![],
        data_len: payload.len() as u64,
    }
}

// ===== RequestVote =====

#[tokio::test]
async fn vote_granted_once_per_term() {
    let q = quiet_node("vote-once").await;

    let resp = q.node.handle_request_vote(vote_req(&q, q.b, 1, 0, 0)).await.unwrap();
    assert!(resp.granted);
    assert_eq!(resp.term, 1);

    // a different candidate in the same term is refused
    let resp = q.node.handle_request_vote(vote_req(&q, q.c, 1, 0, 0)).await.unwrap();
    assert!(!resp.granted);

    // a retransmission from the voted-for candidate is granted again
    let resp = q.node.handle_request_vote(vote_req(&q, q.b, 1, 0, 0)).await.unwrap();
    assert!(resp.granted);

    assert_eq!(q.node.describe().await.voted_for, Some(q.b));
    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn vote_rejected_while_a_leader_is_known() {
    let q = quiet_node("vote-leader-guard").await;

    // b establishes itself as leader
    let resp = q
        .node
        .handle_append_entries(append_req(&q, q.b, 1, (0, 0), vec![], vec![], 0))
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(q.node.leader_id().await, Some(q.b));

    // even a higher-term candidate is ignored while the leader looks alive
    let resp = q.node.handle_request_vote(vote_req(&q, q.c, 2, 0, 0)).await.unwrap();
    assert!(!resp.granted);
    assert_eq!(q.node.describe().await.term, 1);

    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_term_vote_rejected() {
    let q = quiet_node("vote-stale").await;
    q.node.increase_term_to(10).await.unwrap();

    // step_down cleared the vote and kept us a follower
    let status = q.node.describe().await;
    assert_eq!(status.role, Role::Follower);
    assert_eq!(status.voted_for, None);

    let resp = q.node.handle_request_vote(vote_req(&q, q.b, 3, 0, 0)).await.unwrap();
    assert!(!resp.granted);
    assert_eq!(resp.term, 10);

    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn vote_requires_up_to_date_log() {
    let q = quiet_node("vote-log-check").await;

    // seed two entries at term 1 through the follower path
    let resp = q
        .node
        .handle_append_entries(append_req(
            &q,
            q.b,
            1,
            (0, 0),
            vec![data_meta(1, b"aaa"), data_meta(1, b"bb")],
            b"aaabb".to_vec(),
            0,
        ))
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.last_log_index, 2);

    // forget the leader so votes are considered at all
    q.node.increase_term_to(5).await.unwrap();

    // empty candidate log: refused
    let resp = q.node.handle_request_vote(vote_req(&q, q.c, 5, 0, 0)).await.unwrap();
    assert!(!resp.granted);

    // same last term but shorter log: refused
    let resp = q.node.handle_request_vote(vote_req(&q, q.c, 5, 1, 1)).await.unwrap();
    assert!(!resp.granted);

    // as long and as recent: granted
    let resp = q.node.handle_request_vote(vote_req(&q, q.c, 5, 2, 1)).await.unwrap();
    assert!(resp.granted);

    q.node.shutdown().await.unwrap();
}

// ===== AppendEntries =====

#[tokio::test]
async fn append_with_index_gap_is_rejected() {
    let q = quiet_node("append-gap").await;
    let resp = q
        .node
        .handle_append_entries(append_req(&q, q.b, 1, (5, 1), vec![], vec![], 0))
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.last_log_index, 0);
    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn append_with_conflicting_prev_rejects_without_truncating() {
    let q = quiet_node("append-prev-conflict").await;
    let resp = q
        .node
        .handle_append_entries(append_req(
            &q,
            q.b,
            1,
            (0, 0),
            vec![data_meta(1, b"x"), data_meta(1, b"y")],
            b"xy".to_vec(),
            0,
        ))
        .await
        .unwrap();
    assert!(resp.success);

    // prev term disagrees: reject, but the local suffix stays
    let resp = q
        .node
        .handle_append_entries(append_req(&q, q.b, 1, (2, 9), vec![], vec![], 0))
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.last_log_index, 2);
    assert_eq!(q.node.describe().await.last_log_index, 2);

    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn replaying_an_identical_append_is_a_no_op() {
    let q = quiet_node("append-replay").await;
    let req = append_req(
        &q,
        q.b,
        1,
        (0, 0),
        vec![data_meta(1, b"abc"), data_meta(1, b"de")],
        b"abcde".to_vec(),
        2,
    );

    let first = q.node.handle_append_entries(req.clone()).await.unwrap();
    assert!(first.success);
    assert_eq!(first.last_log_index, 2);

    let replay = q.node.handle_append_entries(req).await.unwrap();
    assert!(replay.success);
    assert_eq!(replay.last_log_index, 2);

    // committed DATA applies exactly once, payloads cut in order
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let applied = q.applied.lock().unwrap().clone();
        if applied.len() == 2 {
            assert_eq!(applied, vec![b"abc".to_vec(), b"de".to_vec()]);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "entries apply");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn conflicting_suffix_is_truncated_on_entry_mismatch() {
    let q = quiet_node("append-truncate").await;
    let resp = q
        .node
        .handle_append_entries(append_req(
            &q,
            q.b,
            1,
            (0, 0),
            vec![data_meta(1, b"x"), data_meta(1, b"y")],
            b"xy".to_vec(),
            0,
        ))
        .await
        .unwrap();
    assert!(resp.success);

    // a newer leader overwrites index 2
    let resp = q
        .node
        .handle_append_entries(append_req(
            &q,
            q.c,
            2,
            (1, 1),
            vec![data_meta(2, b"z")],
            b"z".to_vec(),
            0,
        ))
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.last_log_index, 2);

    // the overwritten entry now matches term 2
    let resp = q
        .node
        .handle_append_entries(append_req(&q, q.c, 2, (2, 2), vec![], vec![], 0))
        .await
        .unwrap();
    assert!(resp.success);

    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_entry_types_are_dropped() {
    let q = quiet_node("append-unknown").await;
    let meta = EntryMeta {
        term: 1,
        entry_type: 42,
        peers: vec![],
        data_len: 3,
    };
    let resp = q
        .node
        .handle_append_entries(append_req(&q, q.b, 1, (0, 0), vec![meta], b"xyz".to_vec(), 0))
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.last_log_index, 0, "unknown entries are not stored");
    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn stale_append_does_not_reset_leader_tracking() {
    let q = quiet_node("append-stale").await;
    q.node.increase_term_to(3).await.unwrap();

    let resp = q
        .node
        .handle_append_entries(append_req(&q, q.b, 2, (0, 0), vec![], vec![], 0))
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.term, 3);
    assert_eq!(q.node.leader_id().await, None);

    q.node.shutdown().await.unwrap();
}

// ===== init and lifecycle =====

#[tokio::test]
async fn init_without_bound_address_is_invalid() {
    use graft::NodeRegistry;
    let registry = NodeRegistry::new();
    let node = Node::new("no-addr".to_string(), 0, registry);
    let err = node
        .init(NodeOptions {
            log_uri: "memory://no-addr/log".into(),
            stable_uri: "memory://no-addr/stable".into(),
            fsm: Some(Box::new(TestStateMachine::new())),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::Invalid(_)));
}

#[tokio::test]
async fn init_with_unknown_storage_scheme_is_not_found() {
    let network = InMemoryNetwork::new();
    let registry = network.open();
    let node = Node::new("bad-uri".to_string(), 0, registry);
    let err = node
        .init(NodeOptions {
            log_uri: "bolt://bad-uri/log".into(),
            stable_uri: "memory://bad-uri/stable".into(),
            fsm: Some(Box::new(TestStateMachine::new())),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::NotFound(_)));
}

#[tokio::test]
async fn duplicate_registration_already_exists() {
    let q = quiet_node("dup-reg").await;
    // same (group, peer) behind the same registry
    let twin = Node::new(q.group.clone(), 0, q.registry.clone());
    let err = twin
        .init(NodeOptions {
            log_uri: "memory://dup-reg-twin/log".into(),
            stable_uri: "memory://dup-reg-twin/stable".into(),
            initial_conf: Configuration::from(vec![q.me]),
            election_timeout_ms: 600_000,
            fsm: Some(Box::new(TestStateMachine::new())),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::AlreadyExists(_)));
    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_blocks_operations_and_is_idempotent() {
    let q = quiet_node("shutdown").await;
    q.node.shutdown().await.unwrap();

    let err = q.node.apply(b"x".to_vec()).await.unwrap_err();
    assert!(matches!(err, RaftError::Invalid(_)));
    assert_eq!(q.node.role().await, Role::Shutdown);

    // a second shutdown is harmless
    q.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn vote_persists_across_restart() {
    let name = "vote-restart";
    let q = quiet_node(name).await;

    let resp = q.node.handle_request_vote(vote_req(&q, q.b, 7, 0, 0)).await.unwrap();
    assert!(resp.granted);
    q.node.shutdown().await.unwrap();

    // reincarnate over the same stores, behind the same registry
    let reborn = Node::new(name.to_string(), 0, q.registry.clone());
    reborn
        .init(NodeOptions {
            log_uri: format!("memory://{name}/log"),
            stable_uri: format!("memory://{name}/stable"),
            initial_conf: Configuration::from(vec![q.me, q.b, q.c]),
            election_timeout_ms: 600_000,
            fsm: Some(Box::new(TestStateMachine::new())),
            ..Default::default()
        })
        .await
        .unwrap();

    let status = reborn.describe().await;
    assert_eq!(status.term, 7);
    assert_eq!(status.voted_for, Some(q.b));

    // the persisted vote still binds this term
    let req = RequestVoteRequest {
        group_id: name.to_string(),
        server_id: q.c,
        peer_id: q.me,
        term: 7,
        last_log_index: 0,
        last_log_term: 0,
    };
    let resp = reborn.handle_request_vote(req).await.unwrap();
    assert!(!resp.granted);

    reborn.shutdown().await.unwrap();
}
