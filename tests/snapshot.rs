//! Snapshot save, install and restart-recovery scenarios.

use std::time::Duration;

use graft::core::config::NodeOptions;
use graft::state_machine::TestStateMachine;
use graft::testing::TestCluster;
use graft::transport::inmemory::InMemoryNetwork;
use graft::transport::traits::InstallSnapshotRequest;
use graft::{Configuration, Node, RaftError, Role};

#[tokio::test]
async fn manual_snapshot_compacts_the_log() {
    let cluster = TestCluster::start_with_snapshots("snap1", 1, 200, 0).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("leader");

    for i in 0..5u8 {
        cluster.node(leader).apply(vec![i]).await.unwrap();
    }
    cluster.node(leader).snapshot().await.expect("snapshot saved");

    let status = cluster.node(leader).describe().await;
    // anchor entry at index 1 plus five data entries
    assert_eq!(status.last_snapshot_index, 6);
    assert!(status.last_snapshot_term >= 1);

    // the node keeps working past the compaction point
    cluster.node(leader).apply(vec![9]).await.unwrap();
    assert_eq!(cluster.applied(leader).len(), 6);

    cluster.shutdown().await;
}

#[tokio::test]
async fn snapshot_without_storage_is_invalid() {
    let network = InMemoryNetwork::new();
    let registry = network.open();
    let node = Node::new("nosnap".to_string(), 0, registry.clone());
    let me = node.server_id();
    let options = NodeOptions {
        log_uri: "memory://nosnap/log".into(),
        stable_uri: "memory://nosnap/stable".into(),
        initial_conf: Configuration::from(vec![me]),
        election_timeout_ms: 60_000,
        fsm: Some(Box::new(TestStateMachine::new())),
        ..Default::default()
    };
    node.init(options).await.unwrap();

    let err = node.snapshot().await.unwrap_err();
    assert!(matches!(err, RaftError::Invalid(_)));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn periodic_snapshot_timer_fires() {
    let cluster = TestCluster::start_with_snapshots("snaptimer", 1, 200, 400).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("leader");
    for i in 0..3u8 {
        cluster.node(leader).apply(vec![i]).await.unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = cluster.node(leader).describe().await;
        if status.last_snapshot_index >= 4 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "snapshot timer should produce a snapshot, at {}",
            status.last_snapshot_index
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn install_snapshot_catches_up_a_lagging_follower() {
    let cluster = TestCluster::start_with_snapshots("snap3", 3, 300, 0).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("leader");

    let lagging = (0..3).find(|i| *i != leader).unwrap();
    cluster.isolate(lagging);

    for i in 0..20u8 {
        cluster.node(leader).apply(vec![i]).await.unwrap();
    }
    let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
    let ok = cluster
        .wait_until(Duration::from_secs(5), |c| {
            (0..3).all(|i| i == lagging || c.applied(i) == expected)
        })
        .await;
    assert!(ok, "healthy replicas are caught up");

    // compact the log on both healthy replicas, so whichever of them leads
    // after the healed follower's inflated term settles, the only way to
    // serve the backlog is InstallSnapshot
    for i in 0..3 {
        if i != lagging {
            cluster.node(i).snapshot().await.expect("snapshot");
            assert_eq!(cluster.node(i).describe().await.last_snapshot_index, 21);
        }
    }
    let snapshot_term = cluster.node(leader).describe().await.last_snapshot_term;

    cluster.network.heal();

    // the follower's next index sits below the compacted prefix, so the
    // replicator ships the snapshot; the follower discards its own log
    let ok = cluster
        .wait_until(Duration::from_secs(10), |c| c.applied(lagging) == expected)
        .await;
    assert!(ok, "lagging follower restores state from the snapshot");

    let follower_status = cluster.node(lagging).describe().await;
    assert_eq!(follower_status.last_snapshot_index, 21);
    assert_eq!(follower_status.last_snapshot_term, snapshot_term);
    assert!(follower_status.committed_index >= 21);

    // replication continues past the snapshot boundary; leadership may
    // have moved while the partition settled
    let leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("leader after heal");
    cluster.node(leader).apply(vec![99]).await.unwrap();
    let ok = cluster
        .wait_until(Duration::from_secs(5), |c| c.applied(lagging).len() == 21)
        .await;
    assert!(ok, "entries after the snapshot replicate normally");

    // re-sending the same snapshot point succeeds without copying
    let follower = cluster.node(lagging).clone();
    let follower_term = follower.describe().await.term;
    let resp = follower
        .handle_install_snapshot(InstallSnapshotRequest {
            group_id: cluster.group.clone(),
            server_id: cluster.nodes[leader].peer,
            peer_id: cluster.nodes[lagging].peer,
            term: follower_term,
            last_included_log_index: follower_status.last_snapshot_index,
            last_included_log_term: follower_status.last_snapshot_term,
            peers: cluster.peers(),
            uri: cluster.snapshot_uri(leader),
        })
        .await
        .expect("idempotent install");
    assert!(resp.success);

    cluster.shutdown().await;
}

#[tokio::test]
async fn restart_restores_term_vote_and_snapshot() {
    let network = InMemoryNetwork::new();
    let registry = network.open();
    let group = "restart-roundtrip".to_string();
    let prefix = "memory://restart-roundtrip/0";

    let make_options = |fsm: TestStateMachine| NodeOptions {
        log_uri: format!("{prefix}/log"),
        stable_uri: format!("{prefix}/stable"),
        snapshot_uri: format!("{prefix}/snapshot"),
        election_timeout_ms: 200,
        fsm: Some(Box::new(fsm)),
        ..Default::default()
    };

    let node = Node::new(group.clone(), 0, registry.clone());
    let me = node.server_id();
    let mut options = make_options(TestStateMachine::new());
    options.initial_conf = Configuration::from(vec![me]);
    node.init(options).await.unwrap();

    // become leader, commit some state, snapshot it
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while node.role().await != Role::Leader {
        assert!(tokio::time::Instant::now() < deadline, "elects itself");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    for i in 0..3u8 {
        node.apply(vec![i]).await.unwrap();
    }
    node.snapshot().await.unwrap();
    let before = node.describe().await;
    assert_eq!(before.last_snapshot_index, 4);
    node.shutdown().await.unwrap();

    // a reincarnation over the same URIs recovers everything
    let fsm = TestStateMachine::new();
    let applied = fsm.applied();
    let reborn = Node::new(group, 0, registry);
    reborn.init(make_options(fsm)).await.unwrap();

    let status = reborn.describe().await;
    assert!(status.term >= before.term);
    assert_eq!(status.last_snapshot_index, 4);
    assert_eq!(status.last_snapshot_term, before.last_snapshot_term);
    // the snapshot replayed into the fresh state machine during init
    assert_eq!(
        applied.lock().unwrap().clone(),
        (0..3u8).map(|i| vec![i]).collect::<Vec<_>>()
    );

    reborn.shutdown().await.unwrap();
}
