//! Per-node agent controller
//!
//! Executes start and stop requests for the local node. Requests for the same
//! URI are serialized; unrelated URIs proceed concurrently.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::family::{Agent, AgentStatus, FamilyRegistry};
use super::uri::AgentUri;
use crate::coordinator::membership::NodeId;
use crate::coordinator::tracker::{ClusterEvent, Tracker};
use crate::error::Result;
use crate::metrics::standard;
use crate::storage::LivenessStore;

/// Outcome of comparing running agents with the liveness record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalVerifyReport {
    /// Recorded but not running, now started again
    pub restarted: Vec<AgentUri>,
    /// Running but not recorded, now stopped
    pub stopped: Vec<AgentUri>,
}

impl LocalVerifyReport {
    pub fn is_clean(&self) -> bool {
        self.restarted.is_empty() && self.stopped.is_empty()
    }
}

enum VerifyAction {
    Restarted,
    Stopped,
}

/// Drives the lifecycle of agents running on this node
pub struct AgentController {
    node_id: NodeId,
    registry: FamilyRegistry,
    store: Arc<dyn LivenessStore>,
    tracker: Arc<Tracker>,
    drain_timeout: Duration,
    running: RwLock<BTreeMap<AgentUri, Arc<dyn Agent>>>,
    locks: Mutex<BTreeMap<AgentUri, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentController {
    pub fn new(
        node_id: NodeId,
        registry: FamilyRegistry,
        store: Arc<dyn LivenessStore>,
        tracker: Arc<Tracker>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            registry,
            store,
            tracker,
            drain_timeout,
            running: RwLock::new(BTreeMap::new()),
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock_for(&self, uri: &AgentUri) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.lock().entry(uri.clone()).or_default().clone()
    }

    // Drop the entry of an agent that is not running once nobody else holds it.
    // New holders clone under the map lock, so the count cannot race.
    fn release_lock(&self, uri: &AgentUri, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        drop(lock);
        let idle = locks.get(uri).is_some_and(|held| Arc::strong_count(held) == 1);
        if idle && !self.is_running(uri) {
            locks.remove(uri);
        }
    }

    /// Agents actually running here
    pub fn running_agents(&self) -> BTreeSet<AgentUri> {
        self.running.read().keys().cloned().collect()
    }

    pub fn is_running(&self, uri: &AgentUri) -> bool {
        self.running.read().contains_key(uri)
    }

    pub fn agent_status(&self, uri: &AgentUri) -> Option<AgentStatus> {
        self.running.read().get(uri).map(|agent| agent.status())
    }

    /// Start an agent; starting a running agent only re-announces it
    pub async fn start_agent(&self, uri: &AgentUri) -> Result<()> {
        let lock = self.lock_for(uri);
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(uri).await
        };
        self.release_lock(uri, lock);
        result
    }

    async fn start_locked(&self, uri: &AgentUri) -> Result<()> {
        if self.is_running(uri) {
            debug!("Agent {} already running on node {}", uri, self.node_id);
            self.record_started(uri).await;
            return Ok(());
        }

        let family = self.registry.for_uri(uri)?;
        let agent = family.build_agent(uri).await?;
        agent.start().await?;

        self.running.write().insert(uri.clone(), agent);
        standard::AGENTS_STARTED.inc();
        standard::RUNNING_AGENTS.inc();
        info!("Started agent {} on node {}", uri, self.node_id);

        self.record_started(uri).await;
        Ok(())
    }

    async fn record_started(&self, uri: &AgentUri) {
        // A missed write is repaired by the next reconciliation
        if let Err(e) = self.store.record_agent_started(self.node_id, uri).await {
            warn!("Failed to record agent {} on node {}: {}", uri, self.node_id, e);
        }
        self.tracker.apply(ClusterEvent::AgentStarted {
            uri: uri.clone(),
            node: self.node_id,
        });
    }

    /// Stop an agent; stopping an agent that is not running is a no-op
    pub async fn stop_agent(&self, uri: &AgentUri) -> Result<()> {
        let lock = self.lock_for(uri);
        let result = {
            let _guard = lock.lock().await;
            self.stop_locked(uri).await
        };
        self.release_lock(uri, lock);
        result
    }

    async fn stop_locked(&self, uri: &AgentUri) -> Result<()> {
        let Some(agent) = self.running.write().remove(uri) else {
            debug!("Agent {} not running on node {}", uri, self.node_id);
            return Ok(());
        };

        self.drain(uri, agent).await;
        standard::AGENTS_STOPPED.inc();
        info!("Stopped agent {} on node {}", uri, self.node_id);

        if let Err(e) = self.store.record_agent_stopped(self.node_id, uri).await {
            warn!("Failed to record stop of {} on node {}: {}", uri, self.node_id, e);
        }
        self.tracker.apply(ClusterEvent::AgentStopped {
            uri: uri.clone(),
            node: self.node_id,
        });
        Ok(())
    }

    // Cancellation is dropping the agent once the drain timeout elapses
    async fn drain(&self, uri: &AgentUri, agent: Arc<dyn Agent>) {
        standard::RUNNING_AGENTS.dec();
        match tokio::time::timeout(self.drain_timeout, agent.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Agent {} failed while stopping: {}", uri, e),
            Err(_) => warn!(
                "Agent {} did not stop within {:?}, cancelling",
                uri, self.drain_timeout
            ),
        }
    }

    /// Stop every local agent
    pub async fn stop_all(&self) {
        for uri in self.running_agents() {
            if let Err(e) = self.stop_agent(&uri).await {
                warn!("Failed to stop agent {} during shutdown: {}", uri, e);
            }
        }
    }

    /// Stop an agent without updating the liveness store or the tracker
    ///
    /// Returns whether the agent was running.
    pub async fn force_stop_local(&self, uri: &AgentUri) -> bool {
        let lock = self.lock_for(uri);
        let stopped = {
            let _guard = lock.lock().await;
            let agent = self.running.write().remove(uri);
            match agent {
                Some(agent) => {
                    warn!("Force-stopping agent {} on node {}", uri, self.node_id);
                    self.drain(uri, agent).await;
                    true
                }
                None => false,
            }
        };
        self.release_lock(uri, lock);
        stopped
    }

    /// Correct drift between running agents and this node's liveness record
    pub async fn verify_local(&self) -> Result<LocalVerifyReport> {
        let mut report = LocalVerifyReport::default();
        let Some(record) = self.store.find_node(self.node_id).await? else {
            debug!("Node {} has no liveness record, skipping local verification", self.node_id);
            return Ok(report);
        };

        let running = self.running_agents();
        let candidates: BTreeSet<AgentUri> = record
            .assigned_agents
            .symmetric_difference(&running)
            .cloned()
            .collect();

        for uri in candidates {
            let lock = self.lock_for(&uri);
            let outcome = {
                let _guard = lock.lock().await;
                self.verify_locked(&uri).await
            };
            self.release_lock(&uri, lock);

            match outcome? {
                Some(VerifyAction::Restarted) => report.restarted.push(uri),
                Some(VerifyAction::Stopped) => report.stopped.push(uri),
                None => {}
            }
        }

        Ok(report)
    }

    async fn verify_locked(&self, uri: &AgentUri) -> Result<Option<VerifyAction>> {
        // Re-read under the lock; a concurrent command may have settled it
        let recorded = match self.store.find_node(self.node_id).await? {
            Some(record) => record.assigned_agents.contains(uri),
            None => return Ok(None),
        };
        let running = self.is_running(uri);

        if recorded && !running {
            info!("Agent {} recorded on node {} but not running, restarting", uri, self.node_id);
            match self.start_locked(uri).await {
                Ok(()) => return Ok(Some(VerifyAction::Restarted)),
                Err(e) => warn!("Failed to restart agent {}: {}", uri, e),
            }
        } else if running && !recorded {
            info!("Agent {} running on node {} but not recorded, stopping", uri, self.node_id);
            self.stop_locked(uri).await?;
            return Ok(Some(VerifyAction::Stopped));
        }
        Ok(None)
    }
}
