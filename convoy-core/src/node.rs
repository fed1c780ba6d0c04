//! Cluster node
//!
//! Hosts the coordination components for one process: inserts the liveness
//! record, runs the heartbeat, election and leader-job loops, and routes
//! inbound commands to the agent controller. Every loop stops on the node's
//! shutdown signal.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentController, FamilyRegistry};
use crate::coordinator::{
    AssignmentReconciler, AssignmentReport, ClusterConfig, ClusterEvent, Command, CommandTarget,
    ControlAddress, DurabilityMode, ExitReason, HealthMonitor, LeaderElector, NodeId, NodeRecord,
    Tracker, VerifyScope,
};
use crate::error::{ConvoyError, Result};
use crate::runtime::ShutdownSignal;
use crate::storage::LivenessStore;
use crate::transport::{send_with_retry, CommandChannel, CommandInbox};

struct NodeInner {
    id: NodeId,
    config: ClusterConfig,
    /// Record template reused when re-registering after eviction
    record: NodeRecord,
    store: Arc<dyn LivenessStore>,
    channel: Arc<dyn CommandChannel>,
    tracker: Arc<Tracker>,
    controller: Arc<AgentController>,
    elector: Arc<LeaderElector>,
    health: HealthMonitor,
    reconciler: AssignmentReconciler,
    heartbeat_healthy: AtomicBool,
}

/// A participating node and its background loops
pub struct ClusterNode {
    inner: Arc<NodeInner>,
    shutdown: ShutdownSignal,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterNode {
    /// Register with the store and start the node's loops
    pub async fn start(
        config: ClusterConfig,
        registry: FamilyRegistry,
        store: Arc<dyn LivenessStore>,
        channel: Arc<dyn CommandChannel>,
        inbox: CommandInbox,
    ) -> Result<Self> {
        config.validate()?;
        if channel.local_address() != &config.control_address {
            return Err(ConvoyError::InvalidConfig {
                reason: format!(
                    "control_address {} does not match channel address {}",
                    config.control_address,
                    channel.local_address()
                ),
            });
        }
        let durability = config.durability;

        let capabilities = registry.supported_agents().await?;
        let id = store.next_node_id().await?;
        let record = NodeRecord::new(id, config.control_address.clone(), capabilities);

        let tracker = Arc::new(Tracker::new(id));
        let controller = Arc::new(AgentController::new(
            id,
            registry.clone(),
            store.clone(),
            tracker.clone(),
            config.drain_timeout,
        ));
        let elector = Arc::new(LeaderElector::new(
            id,
            store.clone(),
            tracker.clone(),
            config.stale_threshold,
        ));
        let health = HealthMonitor::new(
            id,
            store.clone(),
            tracker.clone(),
            elector.clone(),
            config.stale_threshold,
        );
        let reconciler = AssignmentReconciler::new(
            id,
            durability,
            registry,
            store.clone(),
            tracker.clone(),
            channel.clone(),
            config.retry_policy(),
        );

        if durability.coordinates() {
            store.insert_node(record.clone()).await?;
        }
        tracker.apply(ClusterEvent::node_joined(id, record.control_address.clone()));
        if durability == DurabilityMode::Solo {
            elector.assume();
        }

        info!(
            node_id = %id,
            "Node started at {} in {} mode with {} hostable agents",
            record.control_address,
            durability,
            record.capabilities.len()
        );

        let inner = Arc::new(NodeInner {
            id,
            config,
            record,
            store,
            channel,
            tracker,
            controller,
            elector,
            health,
            reconciler,
            heartbeat_healthy: AtomicBool::new(true),
        });

        let shutdown = ShutdownSignal::new();
        let mut tasks = Vec::new();
        if durability.coordinates() {
            tasks.push(tokio::spawn(heartbeat_loop(inner.clone(), shutdown.clone())));
            tasks.push(tokio::spawn(leader_jobs_loop(inner.clone(), shutdown.clone())));
        }
        if durability == DurabilityMode::Balanced {
            tasks.push(tokio::spawn(election_loop(inner.clone(), shutdown.clone())));
        }
        if durability.listens() {
            tasks.push(tokio::spawn(command_loop(inner.clone(), inbox, shutdown.clone())));
        } else {
            debug!("Node {} does not consume commands", id);
        }

        Ok(Self {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn control_address(&self) -> &ControlAddress {
        &self.inner.record.control_address
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.inner.tracker
    }

    pub fn controller(&self) -> &Arc<AgentController> {
        &self.inner.controller
    }

    pub fn is_leader(&self) -> bool {
        self.inner.tracker.is_leader()
    }

    /// Evict stale nodes now; leader only
    pub async fn run_health_check(&self) -> Result<Vec<NodeId>> {
        self.inner.require_leader()?;
        self.inner.health_check().await
    }

    /// Reconcile agent placement now; leader only
    pub async fn reconcile(&self) -> Result<AssignmentReport> {
        self.inner.require_leader()?;
        self.inner.reconciler.reconcile().await
    }

    /// Route a command to its target node
    pub async fn dispatch(&self, target: CommandTarget, command: Command) -> Result<()> {
        let inner = &self.inner;
        let node = match target {
            CommandTarget::Local => return inner.channel.enqueue_locally(command).await,
            CommandTarget::Node(node) => node,
            CommandTarget::AgentOwner(uri) => match inner.tracker.agent_owner(&uri) {
                Some(owner) => owner,
                None => {
                    let records = inner.store.list_nodes().await?;
                    match records.iter().find(|r| r.assigned_agents.contains(&uri)) {
                        Some(record) => record.id,
                        None => return Err(ConvoyError::UnknownAgent { uri }),
                    }
                }
            },
        };

        if node == inner.id {
            return inner.channel.enqueue_locally(command).await;
        }
        let address = inner
            .store
            .find_node(node)
            .await?
            .map(|r| r.control_address)
            .ok_or(ConvoyError::NodeNotRegistered { node_id: node })?;
        send_with_retry(inner.channel.as_ref(), &address, command, inner.config.retry_policy()).await
    }

    /// Stop loops and agents, give up leadership and delete the record
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        info!(node_id = %inner.id, "Node shutting down");
        self.shutdown.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Node {} loop ended abnormally: {}", inner.id, e);
            }
        }

        inner.controller.stop_all().await;
        if !inner.config.durability.coordinates() {
            return Ok(());
        }

        if let Err(e) = inner.elector.relinquish().await {
            warn!("Node {} failed to relinquish leadership: {}", inner.id, e);
        }
        inner.store.delete_node(inner.id).await?;
        inner.tracker.apply(ClusterEvent::NodeExited {
            node: inner.id,
            reason: ExitReason::Graceful,
        });
        info!(node_id = %inner.id, "Node stopped");
        Ok(())
    }
}

impl NodeInner {
    fn require_leader(&self) -> Result<()> {
        if self.tracker.is_leader() {
            Ok(())
        } else {
            Err(ConvoyError::NotLeader { node_id: self.id })
        }
    }

    async fn health_check(&self) -> Result<Vec<NodeId>> {
        let evicted = self.health.run_once().await?;
        if !evicted.is_empty() && self.tracker.is_leader() {
            // Released agents need a home now, not on the next timer
            self.reconciler.reconcile().await?;
        }
        Ok(evicted)
    }

    async fn run_leader_jobs(&self) {
        if let Err(e) = self.health_check().await {
            warn!("Health check on node {} failed: {}", self.id, e);
        }
        if let Err(e) = self.reconciler.reconcile().await {
            warn!("Reconciliation on node {} failed: {}", self.id, e);
        }
    }

    async fn handle(&self, command: Command) -> Result<()> {
        match command {
            Command::StartAgent { uri } => {
                if !self.config.durability.coordinates() {
                    return Err(ConvoyError::CoordinationDisabled {
                        mode: self.config.durability.to_string(),
                    });
                }
                self.controller.start_agent(&uri).await
            }
            Command::StopAgent { uri } => self.controller.stop_agent(&uri).await,
            Command::RunHealthCheck => {
                if !self.tracker.is_leader() {
                    debug!("Node {} is not leader, ignoring health check request", self.id);
                    return Ok(());
                }
                self.health_check().await.map(|_| ())
            }
            Command::VerifyAssignments { scope: VerifyScope::Cluster } if self.tracker.is_leader() => {
                self.reconciler.verify_cluster().await.map(|_| ())
            }
            // A follower only checks itself; cluster verification is the leader's
            Command::VerifyAssignments { .. } => {
                let report = self.controller.verify_local().await?;
                if !report.is_clean() {
                    info!(
                        "Local verification on node {} restarted {} and stopped {} agents",
                        self.id,
                        report.restarted.len(),
                        report.stopped.len()
                    );
                }
                Ok(())
            }
        }
    }

    /// Pull peer membership and agent ownership from the store into the tracker
    async fn refresh_view(&self) -> Result<()> {
        let records = self.store.list_nodes().await?;
        self.tracker.sync_from_records(&records);
        Ok(())
    }

    async fn reregister(&self) -> Result<()> {
        warn!(node_id = %self.id, "Liveness record is gone, stopping agents and re-registering");
        self.elector.step_down().await;
        self.controller.stop_all().await;

        let mut record = self.record.clone();
        record.last_seen = Utc::now();
        self.store.insert_node(record).await?;
        self.tracker
            .apply(ClusterEvent::node_joined(self.id, self.record.control_address.clone()));
        Ok(())
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn heartbeat_loop(inner: Arc<NodeInner>, shutdown: ShutdownSignal) {
    let mut ticker = ticker(inner.config.heartbeat_interval);
    let mut failing_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        match inner.store.heartbeat(inner.id, Utc::now()).await {
            Ok(()) => {
                if failing_since.take().is_some() {
                    info!(node_id = %inner.id, "Heartbeats recovered");
                }
                inner.heartbeat_healthy.store(true, Ordering::SeqCst);

                // Solo nodes plan over themselves only
                if inner.config.durability == DurabilityMode::Balanced {
                    if let Err(e) = inner.refresh_view().await {
                        warn!("Node {} failed to refresh its cluster view: {}", inner.id, e);
                    }
                }
            }
            Err(ConvoyError::NodeNotRegistered { .. }) => {
                if let Err(e) = inner.reregister().await {
                    warn!("Node {} failed to re-register: {}", inner.id, e);
                    continue;
                }
                failing_since = None;
                inner.heartbeat_healthy.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                inner.heartbeat_healthy.store(false, Ordering::SeqCst);
                let since = *failing_since.get_or_insert_with(Instant::now);
                warn!(node_id = %inner.id, "Heartbeat failed: {}", e);

                if inner.config.durability == DurabilityMode::Balanced {
                    inner.elector.step_down().await;
                }
                // Peers will have evicted us by now; avoid running duplicates
                if since.elapsed() >= inner.config.stale_threshold
                    && !inner.controller.running_agents().is_empty()
                {
                    warn!(
                        node_id = %inner.id,
                        "Heartbeats failing for {:?}, stopping local agents",
                        since.elapsed()
                    );
                    inner.controller.stop_all().await;
                }
            }
        }
    }
    debug!("Heartbeat loop for node {} stopped", inner.id);
}

async fn election_loop(inner: Arc<NodeInner>, shutdown: ShutdownSignal) {
    let mut ticker = ticker(inner.config.election_interval);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = ticker.tick() => {}
        }

        // A node that cannot heartbeat must not lead
        if !inner.heartbeat_healthy.load(Ordering::SeqCst) {
            continue;
        }

        match inner.elector.tick().await {
            Ok(true) => {
                info!(node_id = %inner.id, "Became leader");
                inner.run_leader_jobs().await;
            }
            Ok(false) => {}
            Err(e) => warn!("Election round on node {} failed: {}", inner.id, e),
        }
    }
    debug!("Election loop for node {} stopped", inner.id);
}

async fn leader_jobs_loop(inner: Arc<NodeInner>, shutdown: ShutdownSignal) {
    let mut health = ticker(inner.config.health_check_interval);
    let mut reconcile = ticker(inner.config.reconcile_interval);

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = health.tick() => {
                if inner.tracker.is_leader() {
                    if let Err(e) = inner.health_check().await {
                        warn!("Health check on node {} failed: {}", inner.id, e);
                    }
                }
            }
            _ = reconcile.tick() => {
                if inner.tracker.is_leader() {
                    if let Err(e) = inner.reconciler.reconcile().await {
                        warn!("Reconciliation on node {} failed: {}", inner.id, e);
                    }
                }
            }
        }
    }
    debug!("Leader jobs loop for node {} stopped", inner.id);
}

async fn command_loop(inner: Arc<NodeInner>, mut inbox: CommandInbox, shutdown: ShutdownSignal) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            received = inbox.recv() => {
                let Some(command) = received else { break };
                let inner = inner.clone();
                in_flight.spawn(async move {
                    let description = command.to_string();
                    if let Err(e) = inner.handle(command).await {
                        warn!("Node {} failed to handle {}: {}", inner.id, description, e);
                    }
                });
            }
        }
    }

    // Let in-flight commands settle before agents are stopped
    while in_flight.join_next().await.is_some() {}
    debug!("Command loop for node {} stopped", inner.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentFamily, AgentStatus, AgentUri};
    use crate::storage::InMemoryLivenessStore;
    use crate::transport::InMemoryCommandHub;
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct IdleAgent(AgentUri);

    #[async_trait]
    impl Agent for IdleAgent {
        fn uri(&self) -> &AgentUri {
            &self.0
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        fn status(&self) -> AgentStatus {
            AgentStatus::Running
        }
    }

    struct IdleFamily;

    #[async_trait]
    impl AgentFamily for IdleFamily {
        fn scheme(&self) -> &str {
            "idle"
        }
        async fn all_known_agents(&self) -> Result<BTreeSet<AgentUri>> {
            Ok([AgentUri::new("idle", "one").unwrap()].into_iter().collect())
        }
        async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>> {
            Ok(Arc::new(IdleAgent(uri.clone())))
        }
    }

    fn config(durability: DurabilityMode) -> ClusterConfig {
        ClusterConfig {
            durability,
            control_address: ControlAddress::new("mem://solo"),
            stale_threshold: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            election_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_millis(50),
            reconcile_interval: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(100),
            command_retry_attempts: 2,
            command_retry_base_delay: Duration::from_millis(10),
        }
    }

    async fn start(durability: DurabilityMode) -> (ClusterNode, Arc<InMemoryLivenessStore>) {
        let store = Arc::new(InMemoryLivenessStore::new());
        let hub = InMemoryCommandHub::new();
        let (channel, inbox) = hub.connect(ControlAddress::new("mem://solo"));
        let registry = FamilyRegistry::new().with(Arc::new(IdleFamily)).unwrap();
        let node = ClusterNode::start(config(durability), registry, store.clone(), channel, inbox)
            .await
            .unwrap();
        (node, store)
    }

    #[tokio::test]
    async fn test_solo_node_leads_and_runs_agents() {
        let (node, store) = start(DurabilityMode::Solo).await;
        assert!(node.is_leader());
        // Solo leadership is never claimed in the store
        assert_eq!(store.load_leader().await.unwrap(), None);

        node.tracker()
            .wait_for("agent placement", Duration::from_secs(2), |s| s.agents.len() == 1)
            .await
            .unwrap();

        node.shutdown().await.unwrap();
        assert!(store.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_serverless_node_rejects_agents() {
        let (node, store) = start(DurabilityMode::Serverless).await;
        assert!(store.list_nodes().await.unwrap().is_empty());

        let err = node
            .inner
            .handle(Command::StartAgent { uri: AgentUri::new("idle", "one").unwrap() })
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::CoordinationDisabled { .. }));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_follower_refuses_leader_jobs() {
        let (node, _) = start(DurabilityMode::Serverless).await;
        assert!(matches!(node.reconcile().await, Err(ConvoyError::NotLeader { .. })));
        assert!(matches!(node.run_health_check().await, Err(ConvoyError::NotLeader { .. })));
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_control_address_rejected() {
        let store = Arc::new(InMemoryLivenessStore::new());
        let hub = InMemoryCommandHub::new();
        let (channel, inbox) = hub.connect(ControlAddress::new("mem://elsewhere"));
        let registry = FamilyRegistry::new().with(Arc::new(IdleFamily)).unwrap();

        let result = ClusterNode::start(
            config(DurabilityMode::Balanced),
            registry,
            store.clone(),
            channel,
            inbox,
        )
        .await;
        assert!(matches!(result, Err(ConvoyError::InvalidConfig { .. })));
        assert!(store.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_evicted_node_reregisters_with_same_id() {
        let (node, store) = start(DurabilityMode::Balanced).await;
        node.tracker().wait_for_leadership(Duration::from_secs(2)).await.unwrap();

        store.delete_node(node.id()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.find_node(node.id()).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        node.shutdown().await.unwrap();
    }
}
