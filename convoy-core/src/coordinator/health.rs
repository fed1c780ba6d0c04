//! Health monitor
//!
//! Leader-side eviction of nodes whose heartbeats went silent. Evicting a
//! node drops its agents from the tracker, leaving them unassigned for the
//! next reconciliation.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::leader::LeaderElector;
use super::membership::{stale_cutoff, NodeId};
use super::tracker::{ClusterEvent, ExitReason, Tracker};
use crate::error::Result;
use crate::metrics::standard;
use crate::storage::LivenessStore;

pub struct HealthMonitor {
    node_id: NodeId,
    store: Arc<dyn LivenessStore>,
    tracker: Arc<Tracker>,
    elector: Arc<LeaderElector>,
    stale_threshold: Duration,
}

impl HealthMonitor {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn LivenessStore>,
        tracker: Arc<Tracker>,
        elector: Arc<LeaderElector>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            node_id,
            store,
            tracker,
            elector,
            stale_threshold,
        }
    }

    /// Evict every stale node other than this one. Returns the evicted ids.
    pub async fn run_once(&self) -> Result<Vec<NodeId>> {
        let stale = self.store.list_stale(stale_cutoff(self.stale_threshold)).await?;
        let believed_leader = self.tracker.leader_id();
        let mut evicted = Vec::new();

        for record in stale.into_iter().filter(|r| r.id != self.node_id) {
            if let Err(e) = self.store.delete_node(record.id).await {
                warn!("Failed to evict stale node {}: {}", record.id, e);
                continue;
            }
            warn!(
                "Evicted node {} (last seen {}, {} agents released)",
                record.id,
                record.last_seen,
                record.assigned_agents.len()
            );
            self.tracker.apply(ClusterEvent::NodeExited {
                node: record.id,
                reason: ExitReason::Evicted,
            });
            standard::NODES_EVICTED.inc();
            evicted.push(record.id);
        }

        if let Some(leader) = believed_leader.filter(|l| evicted.contains(l)) {
            info!("Evicted node {} was the leader, claiming leadership", leader);
            if let Err(e) = self.elector.try_claim().await {
                warn!("Leadership claim after evicting {} failed: {}", leader, e);
            }
        }

        Ok(evicted)
    }
}
