//! Assignment reconciliation
//!
//! Leader-side diff-and-correct of agent placement. Each run lists the
//! liveness records, rebuilds the grid from scratch, lets every family
//! express its desired distribution and sends the stop/start commands that
//! close the gap. Runs may overlap; every command they issue is idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::command::{Command, VerifyScope};
use super::config::DurabilityMode;
use super::grid::AssignmentGrid;
use super::membership::{ControlAddress, NodeId, NodeRecord};
use super::tracker::Tracker;
use crate::agent::FamilyRegistry;
use crate::error::Result;
use crate::metrics::standard;
use crate::storage::LivenessStore;
use crate::transport::{send_with_retry, CommandChannel, RetryPolicy};

/// A command that could not be delivered
#[derive(Debug, Clone)]
pub struct CommandFailure {
    pub node: NodeId,
    pub command: Command,
    pub reason: String,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Default)]
pub struct AssignmentReport {
    /// Commands delivered
    pub commands_issued: usize,
    /// Commands that exhausted their retries
    pub failures: Vec<CommandFailure>,
}

impl AssignmentReport {
    pub fn is_converged(&self) -> bool {
        self.commands_issued == 0 && self.failures.is_empty()
    }
}

pub struct AssignmentReconciler {
    node_id: NodeId,
    durability: DurabilityMode,
    registry: FamilyRegistry,
    store: Arc<dyn LivenessStore>,
    tracker: Arc<Tracker>,
    channel: Arc<dyn CommandChannel>,
    retry: RetryPolicy,
}

impl AssignmentReconciler {
    pub fn new(
        node_id: NodeId,
        durability: DurabilityMode,
        registry: FamilyRegistry,
        store: Arc<dyn LivenessStore>,
        tracker: Arc<Tracker>,
        channel: Arc<dyn CommandChannel>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            node_id,
            durability,
            registry,
            store,
            tracker,
            channel,
            retry,
        }
    }

    async fn active_records(&self) -> Result<Vec<NodeRecord>> {
        let mut records = self.store.list_nodes().await?;
        if self.durability == DurabilityMode::Solo {
            records.retain(|r| r.id == self.node_id);
        }
        standard::ACTIVE_NODES.set(records.len() as i64);
        Ok(records)
    }

    /// Build the grid the families would have this cycle
    pub async fn plan(&self, records: &[NodeRecord]) -> Result<AssignmentGrid> {
        let mut grid = AssignmentGrid::from_records(records);
        for family in self.registry.families() {
            grid.add_known_agents(family.all_known_agents().await?);
            family.evaluate_assignments(&mut grid).await?;
        }
        Ok(grid)
    }

    /// Diff desired placement against the liveness records and correct it
    pub async fn reconcile(&self) -> Result<AssignmentReport> {
        let started = Instant::now();
        standard::RECONCILE_RUNS.inc();

        let records = self.active_records().await?;
        self.tracker.sync_from_records(&records);
        let grid = self.plan(&records).await?;

        let addresses: BTreeMap<NodeId, ControlAddress> = records
            .iter()
            .map(|r| (r.id, r.control_address.clone()))
            .collect();
        let unassigned = grid.unassigned();
        if !unassigned.is_empty() {
            warn!("{} agents have no eligible node", unassigned.len());
        }

        let mut report = AssignmentReport::default();
        for change in grid.changes() {
            for node in &change.stop_on {
                let command = Command::StopAgent { uri: change.uri.clone() };
                self.issue(&addresses, *node, command, &mut report).await;
            }
            if let Some(node) = change.start_on {
                let command = Command::StartAgent { uri: change.uri.clone() };
                self.issue(&addresses, node, command, &mut report).await;
            }
        }

        standard::RECONCILE_DURATION.observe_duration(started.elapsed());
        if report.is_converged() {
            debug!("Reconciliation found placement converged");
        } else {
            info!(
                "Reconciliation issued {} commands ({} failed) across {} nodes",
                report.commands_issued,
                report.failures.len(),
                records.len()
            );
        }
        Ok(report)
    }

    /// Reconcile, then ask every node to check itself against its record
    pub async fn verify_cluster(&self) -> Result<AssignmentReport> {
        let mut report = self.reconcile().await?;
        let records = self.active_records().await?;
        let addresses: BTreeMap<NodeId, ControlAddress> = records
            .iter()
            .map(|r| (r.id, r.control_address.clone()))
            .collect();

        for node in addresses.keys() {
            let command = Command::VerifyAssignments { scope: VerifyScope::Local };
            self.issue(&addresses, *node, command, &mut report).await;
        }
        Ok(report)
    }

    async fn issue(
        &self,
        addresses: &BTreeMap<NodeId, ControlAddress>,
        node: NodeId,
        command: Command,
        report: &mut AssignmentReport,
    ) {
        let Some(address) = addresses.get(&node) else {
            report.failures.push(CommandFailure {
                node,
                command,
                reason: "node has no control address".into(),
            });
            return;
        };

        debug!("Sending {} to node {}", command, node);
        match send_with_retry(self.channel.as_ref(), address, command.clone(), self.retry).await {
            Ok(()) => report.commands_issued += 1,
            Err(e) => {
                warn!("Failed to deliver {} to node {}: {}", command, node, e);
                report.failures.push(CommandFailure {
                    node,
                    command,
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentFamily, AgentUri};
    use crate::error::ConvoyError;
    use crate::storage::InMemoryLivenessStore;
    use crate::transport::{CommandInbox, InMemoryCommandHub};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct CountingFamily(usize);

    #[async_trait]
    impl AgentFamily for CountingFamily {
        fn scheme(&self) -> &str {
            "fake"
        }

        async fn all_known_agents(&self) -> Result<BTreeSet<AgentUri>> {
            Ok((0..self.0).map(|i| AgentUri::new("fake", &format!("{:02}", i)).unwrap()).collect())
        }

        async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>> {
            Err(ConvoyError::UnknownAgent { uri: uri.clone() })
        }
    }

    async fn setup(nodes: u32, agents: usize) -> (AssignmentReconciler, Arc<InMemoryLivenessStore>, Vec<CommandInbox>) {
        let store = Arc::new(InMemoryLivenessStore::new());
        let hub = InMemoryCommandHub::new();
        let registry = FamilyRegistry::new().with(Arc::new(CountingFamily(agents))).unwrap();
        let capabilities = registry.supported_agents().await.unwrap();

        let mut inboxes = Vec::new();
        let mut leader_channel = None;
        for id in 1..=nodes {
            let address = ControlAddress::new(format!("mem://{}", id));
            let (channel, inbox) = hub.connect(address.clone());
            store
                .insert_node(NodeRecord::new(NodeId(id), address, capabilities.clone()))
                .await
                .unwrap();
            inboxes.push(inbox);
            leader_channel.get_or_insert(channel);
        }

        let reconciler = AssignmentReconciler::new(
            NodeId(1),
            DurabilityMode::Balanced,
            registry,
            store.clone(),
            Arc::new(Tracker::new(NodeId(1))),
            leader_channel.unwrap(),
            RetryPolicy::default(),
        );
        (reconciler, store, inboxes)
    }

    fn drain(inbox: &mut CommandInbox) -> Vec<Command> {
        let mut commands = Vec::new();
        while let Ok(command) = inbox.try_recv() {
            commands.push(command);
        }
        commands
    }

    #[tokio::test]
    async fn test_fresh_cluster_gets_start_commands() {
        let (reconciler, _, mut inboxes) = setup(2, 4).await;
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.commands_issued, 4);

        let first = drain(&mut inboxes[0]);
        let second = drain(&mut inboxes[1]);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|c| matches!(c, Command::StartAgent { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_is_stopped_on_extra_owner() {
        let (reconciler, store, mut inboxes) = setup(2, 2).await;
        let uri = AgentUri::parse("fake://00").unwrap();
        store.record_agent_started(NodeId(1), &uri).await.unwrap();
        store.record_agent_started(NodeId(2), &uri).await.unwrap();

        reconciler.reconcile().await.unwrap();
        let to_second = drain(&mut inboxes[1]);
        assert!(to_second.contains(&Command::StopAgent { uri }));
        drain(&mut inboxes[0]);
    }

    #[tokio::test]
    async fn test_forgotten_agent_is_stopped() {
        let (reconciler, store, mut inboxes) = setup(1, 0).await;
        let uri = AgentUri::parse("fake://retired").unwrap();
        store.record_agent_started(NodeId(1), &uri).await.unwrap();

        reconciler.reconcile().await.unwrap();
        assert_eq!(drain(&mut inboxes[0]), vec![Command::StopAgent { uri }]);
    }

    #[tokio::test]
    async fn test_verify_cluster_fans_out_local_checks() {
        let (reconciler, _, mut inboxes) = setup(3, 0).await;
        let report = reconciler.verify_cluster().await.unwrap();
        assert_eq!(report.commands_issued, 3);
        for inbox in &mut inboxes {
            assert_eq!(
                drain(inbox),
                vec![Command::VerifyAssignments { scope: VerifyScope::Local }]
            );
        }
    }
}
