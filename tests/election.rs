//! Leader election scenarios over the in-memory network.

use std::time::Duration;

use graft::testing::TestCluster;
use graft::Role;

#[tokio::test]
async fn three_peer_election() {
    let cluster = TestCluster::start("election3", 3, 300).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("a leader is elected");

    let status = cluster.node(leader).describe().await;
    assert_eq!(status.role, Role::Leader);
    assert!(status.term >= 1);
    // the leader anchors its term with a configuration entry
    assert!(status.last_log_index >= 1);
    assert_eq!(status.peers.len(), 3);

    // the cluster converges: exactly one leader, every node pointing at it
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut leaders = Vec::new();
        let mut adopted = 0;
        let mut candidate_leader = None;
        for (i, test_node) in cluster.nodes.iter().enumerate() {
            let status = test_node.node.describe().await;
            if status.role == Role::Leader {
                leaders.push(i);
                candidate_leader = Some(test_node.peer);
            }
        }
        if let Some(peer) = candidate_leader {
            for test_node in &cluster.nodes {
                if test_node.node.leader_id().await == Some(peer) {
                    adopted += 1;
                }
            }
        }
        if leaders.len() == 1 && adopted == cluster.nodes.len() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "cluster should converge on one leader"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn single_node_elects_itself() {
    let cluster = TestCluster::start("election1", 1, 200).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("singleton elects itself");
    let status = cluster.node(leader).describe().await;
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.peers.len(), 1);
    cluster.shutdown().await;
}

#[tokio::test]
async fn isolated_leader_steps_down() {
    let cluster = TestCluster::start("isolation", 3, 300).await;
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("initial leader");

    cluster.isolate(leader);

    // the step-down watchdog counts both peers dead after an election
    // timeout and demotes the leader
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cluster.node(leader).role().await == Role::Leader {
        assert!(
            tokio::time::Instant::now() < deadline,
            "leader should step down while partitioned"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(cluster.node(leader).role().await, Role::Follower);

    // the majority side elects a replacement
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let new_leader = loop {
        let mut found = None;
        for (i, test_node) in cluster.nodes.iter().enumerate() {
            if i != leader && test_node.node.role().await == Role::Leader {
                found = Some(i);
            }
        }
        if let Some(i) = found {
            break i;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "majority should elect a new leader"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_ne!(new_leader, leader);

    cluster.heal();
    cluster.shutdown().await;
}
