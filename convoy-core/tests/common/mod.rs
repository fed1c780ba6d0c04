//! Shared harness for cluster integration tests
//!
//! Multi-node clusters over the in-memory store and hub, with a fake agent
//! family that counts how often each agent was started.

#![allow(dead_code)]

use async_trait::async_trait;
use convoy_core::agent::{Agent, AgentFamily, AgentStatus, AgentUri, FamilyRegistry};
use convoy_core::coordinator::{ClusterConfig, ControlAddress, DurabilityMode};
use convoy_core::storage::InMemoryLivenessStore;
use convoy_core::transport::InMemoryCommandHub;
use convoy_core::{ClusterNode, ConvoyError, NodeId, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

pub const STALE_THRESHOLD: Duration = Duration::from_millis(300);
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(50);

pub fn test_config(address: ControlAddress) -> ClusterConfig {
    ClusterConfig {
        durability: DurabilityMode::Balanced,
        control_address: address,
        stale_threshold: STALE_THRESHOLD,
        heartbeat_interval: Duration::from_millis(50),
        election_interval: Duration::from_millis(50),
        health_check_interval: HEALTH_CHECK_INTERVAL,
        reconcile_interval: Duration::from_millis(100),
        drain_timeout: Duration::from_millis(100),
        command_retry_attempts: 3,
        command_retry_base_delay: Duration::from_millis(5),
    }
}

pub fn fake_uri(i: usize) -> AgentUri {
    AgentUri::new("fake", &format!("{:02}", i)).unwrap()
}

/// How often each agent has been started, across all nodes
#[derive(Default)]
pub struct StartLog {
    starts: Mutex<BTreeMap<AgentUri, usize>>,
}

impl StartLog {
    pub fn starts(&self, uri: &AgentUri) -> usize {
        self.starts.lock().get(uri).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.starts.lock().values().sum()
    }
}

struct FakeAgent {
    uri: AgentUri,
    log: Arc<StartLog>,
}

#[async_trait]
impl Agent for FakeAgent {
    fn uri(&self) -> &AgentUri {
        &self.uri
    }

    async fn start(&self) -> Result<()> {
        *self.log.starts.lock().entry(self.uri.clone()).or_default() += 1;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> AgentStatus {
        AgentStatus::Running
    }
}

/// Family of `fake://NN` agents
pub struct FakeFamily {
    agents: BTreeSet<AgentUri>,
    pub log: Arc<StartLog>,
}

impl FakeFamily {
    pub fn new(count: usize) -> Self {
        Self {
            agents: (0..count).map(fake_uri).collect(),
            log: Arc::new(StartLog::default()),
        }
    }
}

#[async_trait]
impl AgentFamily for FakeFamily {
    fn scheme(&self) -> &str {
        "fake"
    }

    async fn all_known_agents(&self) -> Result<BTreeSet<AgentUri>> {
        Ok(self.agents.clone())
    }

    async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>> {
        if !self.agents.contains(uri) {
            return Err(ConvoyError::UnknownAgent { uri: uri.clone() });
        }
        Ok(Arc::new(FakeAgent {
            uri: uri.clone(),
            log: self.log.clone(),
        }))
    }
}

/// In-process cluster sharing one store and one hub
pub struct TestCluster {
    pub store: Arc<InMemoryLivenessStore>,
    pub hub: InMemoryCommandHub,
    pub family: Arc<FakeFamily>,
    pub nodes: Vec<ClusterNode>,
    registry: FamilyRegistry,
    spawned: usize,
}

impl TestCluster {
    pub fn new(agents: usize) -> Self {
        let family = Arc::new(FakeFamily::new(agents));
        let registry = FamilyRegistry::new().with(family.clone()).unwrap();
        Self {
            store: Arc::new(InMemoryLivenessStore::new()),
            hub: InMemoryCommandHub::new(),
            family,
            nodes: Vec::new(),
            registry,
            spawned: 0,
        }
    }

    pub async fn add_node(&mut self) -> NodeId {
        self.spawned += 1;
        let address = ControlAddress::new(format!("mem://node-{}", self.spawned));
        let (channel, inbox) = self.hub.connect(address.clone());
        let node = ClusterNode::start(
            test_config(address),
            self.registry.clone(),
            self.store.clone(),
            channel,
            inbox,
        )
        .await
        .unwrap();
        let id = node.id();
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &ClusterNode {
        self.nodes.iter().find(|n| n.id() == id).unwrap()
    }

    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes.iter().filter(|n| n.is_leader()).map(|n| n.id()).collect()
    }

    pub fn leader(&self) -> Option<&ClusterNode> {
        let leaders = self.leaders();
        match leaders.as_slice() {
            [only] => Some(self.node(*only)),
            _ => None,
        }
    }

    /// Gracefully stop one node and drop it from the cluster
    pub async fn stop_node(&mut self, id: NodeId) {
        let index = self.nodes.iter().position(|n| n.id() == id).unwrap();
        let node = self.nodes.remove(index);
        node.shutdown().await.unwrap();
        self.hub.disconnect(node.control_address());
    }

    /// Agents actually running, per node
    pub fn placement(&self) -> BTreeMap<NodeId, BTreeSet<AgentUri>> {
        self.nodes
            .iter()
            .map(|n| (n.id(), n.controller().running_agents()))
            .collect()
    }

    /// Sorted per-node running counts
    pub fn counts(&self) -> Vec<usize> {
        let mut counts: Vec<usize> = self.placement().values().map(|a| a.len()).collect();
        counts.sort_unstable();
        counts
    }

    /// Every known agent runs on exactly one node
    pub fn each_agent_runs_once(&self, agents: usize) -> bool {
        let placement = self.placement();
        let total: usize = placement.values().map(|a| a.len()).sum();
        let unique: BTreeSet<&AgentUri> = placement.values().flatten().collect();
        total == agents && unique.len() == agents
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
    }
}

/// Poll until the condition holds or the timeout passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
