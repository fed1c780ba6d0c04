//! Even agent distribution as nodes join and leave

mod common;

use common::{fake_uri, TestCluster};
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(3);

#[tokio::test]
async fn test_single_node_runs_everything() {
    let mut cluster = TestCluster::new(12);
    cluster.add_node().await;

    assert!(common::wait_until(SETTLE, || cluster.counts() == vec![12]).await);
    assert_eq!(cluster.family.log.total(), 12);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_second_node_takes_half_without_restarts() {
    let mut cluster = TestCluster::new(12);
    let first = cluster.add_node().await;
    assert!(common::wait_until(SETTLE, || cluster.counts() == vec![12]).await);

    cluster.add_node().await;
    assert!(common::wait_until(SETTLE, || cluster.counts() == vec![6, 6]).await);
    assert!(cluster.each_agent_runs_once(12));

    // Agents left on the first node were never restarted; the rest moved once
    let kept = cluster.placement()[&first].clone();
    for i in 0..12 {
        let uri = fake_uri(i);
        let expected = if kept.contains(&uri) { 1 } else { 2 };
        assert_eq!(cluster.family.log.starts(&uri), expected, "unexpected starts for {}", uri);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_node_removal_rebalances() {
    let mut cluster = TestCluster::new(12);
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(cluster.add_node().await);
    }
    assert!(common::wait_until(SETTLE, || cluster.counts() == vec![3, 3, 3, 3]).await);

    let leader = cluster.leader().unwrap().id();
    let victim = ids.into_iter().find(|id| *id != leader).unwrap();
    cluster.stop_node(victim).await;

    assert!(common::wait_until(SETTLE, || cluster.counts() == vec![4, 4, 4]).await);
    assert!(cluster.each_agent_runs_once(12));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unknown_agents_are_not_started() {
    let mut cluster = TestCluster::new(2);
    let id = cluster.add_node().await;
    assert!(common::wait_until(SETTLE, || cluster.counts() == vec![2]).await);

    let node = cluster.node(id);
    let err = node
        .controller()
        .start_agent(&convoy_core::AgentUri::parse("fake://99").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, convoy_core::ConvoyError::UnknownAgent { .. }));
    assert_eq!(cluster.counts(), vec![2]);

    cluster.shutdown().await;
}

/// Every node's tracker agrees with the actual placement
fn views_match(cluster: &TestCluster) -> bool {
    let placement = cluster.placement();
    let ids: Vec<_> = placement.keys().copied().collect();
    cluster.nodes.iter().all(|node| {
        let snapshot = node.tracker().snapshot();
        snapshot.nodes.keys().copied().collect::<Vec<_>>() == ids
            && placement
                .iter()
                .all(|(owner, agents)| snapshot.agents_on(*owner) == *agents)
    })
}

#[tokio::test]
async fn test_followers_track_whole_cluster() {
    let mut cluster = TestCluster::new(6);
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(cluster.add_node().await);
    }
    assert!(common::wait_until(SETTLE, || cluster.counts() == vec![2, 2, 2]).await);
    assert!(common::wait_until(SETTLE, || views_match(&cluster)).await);

    for node in &cluster.nodes {
        let snapshot = node.tracker().snapshot();
        println!(
            "node {} leader={} tracker nodes={:?} agents_known={}",
            node.id(),
            node.is_leader(),
            snapshot.nodes.keys().collect::<Vec<_>>(),
            snapshot.agents.len()
        );
        assert_eq!(snapshot.agents.len(), 6);
    }

    // A departed peer drops out of the survivors' views
    let leader = cluster.leader().unwrap().id();
    let victim = ids.into_iter().find(|id| *id != leader).unwrap();
    cluster.stop_node(victim).await;

    assert!(common::wait_until(SETTLE, || cluster.counts() == vec![3, 3]).await);
    assert!(common::wait_until(SETTLE, || views_match(&cluster)).await);
    for node in &cluster.nodes {
        assert!(node.tracker().node(victim).is_none());
    }

    cluster.shutdown().await;
}
