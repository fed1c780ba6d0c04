//! Leader election across in-process nodes
//!
//! Sole-node promotion, single leadership, and handoff away from a leader
//! whose heartbeats fail.

mod common;

use common::{TestCluster, HEALTH_CHECK_INTERVAL, STALE_THRESHOLD};
use convoy_core::storage::LivenessStore;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_sole_node_becomes_leader() {
    let mut cluster = TestCluster::new(0);
    let id = cluster.add_node().await;

    cluster
        .node(id)
        .tracker()
        .wait_for_leadership(STALE_THRESHOLD + Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(cluster.store.load_leader().await.unwrap(), Some(id));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_exactly_one_leader() {
    let mut cluster = TestCluster::new(0);
    for _ in 0..3 {
        cluster.add_node().await;
    }

    assert!(common::wait_until(Duration::from_secs(2), || cluster.leaders().len() == 1).await);

    // Followers agree on who leads
    let leader = cluster.leaders()[0];
    assert!(common::wait_until(Duration::from_secs(2), || {
        cluster.nodes.iter().all(|n| n.tracker().leader_id() == Some(leader))
    })
    .await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failing_leader_hands_off() {
    let mut cluster = TestCluster::new(6);
    for _ in 0..3 {
        cluster.add_node().await;
    }
    assert!(common::wait_until(Duration::from_secs(2), || cluster.leader().is_some()).await);
    let old = cluster.leader().unwrap().id();

    let started = Instant::now();
    cluster.store.fail_heartbeats(old, true);

    let handed_off = common::wait_until(STALE_THRESHOLD + HEALTH_CHECK_INTERVAL + Duration::from_millis(500), || {
        let leaders = cluster.leaders();
        leaders.len() == 1 && leaders[0] != old
    })
    .await;
    assert!(handed_off, "no follower took over from node {}", old);
    assert!(!cluster.node(old).is_leader());
    println!("Leadership moved away from node {} after {:?}", old, started.elapsed());

    // The silent node is evicted and its agents end up placed exactly once
    assert!(common::wait_until(Duration::from_secs(3), || {
        cluster.node(old).controller().running_agents().is_empty() && cluster.each_agent_runs_once(6)
    })
    .await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_graceful_leader_exit_hands_off() {
    let mut cluster = TestCluster::new(0);
    for _ in 0..2 {
        cluster.add_node().await;
    }
    assert!(common::wait_until(Duration::from_secs(2), || cluster.leader().is_some()).await);
    let old = cluster.leader().unwrap().id();

    cluster.stop_node(old).await;
    assert!(common::wait_until(Duration::from_secs(2), || cluster.leader().is_some()).await);
    assert_ne!(cluster.store.load_leader().await.unwrap(), Some(old));

    cluster.shutdown().await;
}
