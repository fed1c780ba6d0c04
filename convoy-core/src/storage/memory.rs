//! In-memory liveness store
//!
//! Shared by every node of an in-process cluster. Supports fault injection
//! (failed heartbeats, full outage, backdated records) for testing the
//! eviction and re-election paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::liveness::LivenessStore;
use crate::agent::AgentUri;
use crate::coordinator::membership::{NodeId, NodeRecord};
use crate::error::{ConvoyError, Result};

#[derive(Default)]
struct StoreState {
    nodes: BTreeMap<NodeId, NodeRecord>,
    leader: Option<NodeId>,
    last_node_id: u32,
}

#[derive(Default)]
struct Faults {
    failing_heartbeats: BTreeSet<NodeId>,
    offline: bool,
}

/// Liveness store backed by process memory
#[derive(Default)]
pub struct InMemoryLivenessStore {
    state: RwLock<StoreState>,
    faults: Mutex<Faults>,
}

impl InMemoryLivenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make heartbeat writes for one node fail, simulating a hung process
    pub fn fail_heartbeats(&self, id: NodeId, failing: bool) {
        let mut faults = self.faults.lock();
        if failing {
            faults.failing_heartbeats.insert(id);
        } else {
            faults.failing_heartbeats.remove(&id);
        }
    }

    /// Make every operation fail, simulating lost connectivity
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Overwrite a node's last heartbeat
    pub fn set_last_seen(&self, id: NodeId, last_seen: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write();
        let record = state
            .nodes
            .get_mut(&id)
            .ok_or(ConvoyError::NodeNotRegistered { node_id: id })?;
        record.last_seen = last_seen;
        Ok(())
    }

    /// Snapshot of all records without going through the async contract
    pub fn records(&self) -> Vec<NodeRecord> {
        self.state.read().nodes.values().cloned().collect()
    }

    fn check_online(&self, operation: &str) -> Result<()> {
        if self.faults.lock().offline {
            return Err(ConvoyError::StorageError {
                message: format!("{} failed: store unreachable", operation),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LivenessStore for InMemoryLivenessStore {
    async fn next_node_id(&self) -> Result<NodeId> {
        self.check_online("next_node_id")?;
        let mut state = self.state.write();
        state.last_node_id += 1;
        Ok(NodeId(state.last_node_id))
    }

    async fn insert_node(&self, record: NodeRecord) -> Result<()> {
        self.check_online("insert_node")?;
        let mut state = self.state.write();

        if let Some(existing) = state.nodes.get(&record.id) {
            if existing.instance != record.instance {
                return Err(ConvoyError::NodeAlreadyRegistered { node_id: record.id });
            }
        }
        // Sequence must stay ahead of externally chosen ids
        state.last_node_id = state.last_node_id.max(record.id.0);

        info!("Inserted liveness record for node {} at {}", record.id, record.control_address);
        state.nodes.insert(record.id, record);
        Ok(())
    }

    async fn delete_node(&self, id: NodeId) -> Result<()> {
        self.check_online("delete_node")?;
        let mut state = self.state.write();
        if state.nodes.remove(&id).is_some() {
            info!("Deleted liveness record for node {}", id);
        }
        if state.leader == Some(id) {
            state.leader = None;
        }
        Ok(())
    }

    async fn heartbeat(&self, id: NodeId, timestamp: DateTime<Utc>) -> Result<()> {
        self.check_online("heartbeat")?;
        if self.faults.lock().failing_heartbeats.contains(&id) {
            return Err(ConvoyError::StorageError {
                message: format!("heartbeat write for node {} rejected", id),
            });
        }

        let mut state = self.state.write();
        let record = state
            .nodes
            .get_mut(&id)
            .ok_or(ConvoyError::NodeNotRegistered { node_id: id })?;
        record.last_seen = timestamp;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.check_online("list_nodes")?;
        Ok(self.records())
    }

    async fn find_node(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        self.check_online("find_node")?;
        Ok(self.state.read().nodes.get(&id).cloned())
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeRecord>> {
        self.check_online("list_stale")?;
        Ok(self
            .state
            .read()
            .nodes
            .values()
            .filter(|r| r.is_stale(cutoff))
            .cloned()
            .collect())
    }

    async fn try_claim_leadership(&self, id: NodeId) -> Result<bool> {
        self.check_online("try_claim_leadership")?;
        let mut state = self.state.write();
        if !state.nodes.contains_key(&id) {
            return Ok(false);
        }
        match state.leader {
            None => {
                state.leader = Some(id);
                debug!("Node {} claimed vacant leadership", id);
                Ok(true)
            }
            Some(holder) => Ok(holder == id),
        }
    }

    async fn try_supersede_leader(&self, id: NodeId, stale: NodeId) -> Result<bool> {
        self.check_online("try_supersede_leader")?;
        let mut state = self.state.write();
        if !state.nodes.contains_key(&id) {
            return Ok(false);
        }
        match state.leader {
            Some(holder) if holder == stale || holder == id => {
                state.leader = Some(id);
                debug!("Node {} superseded leader {}", id, stale);
                Ok(true)
            }
            None => {
                state.leader = Some(id);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn release_leadership(&self, id: NodeId) -> Result<()> {
        self.check_online("release_leadership")?;
        let mut state = self.state.write();
        if state.leader == Some(id) {
            state.leader = None;
            debug!("Node {} released leadership", id);
        }
        Ok(())
    }

    async fn load_leader(&self) -> Result<Option<NodeId>> {
        self.check_online("load_leader")?;
        Ok(self.state.read().leader)
    }

    async fn record_agent_started(&self, id: NodeId, uri: &AgentUri) -> Result<()> {
        self.check_online("record_agent_started")?;
        let mut state = self.state.write();
        let record = state
            .nodes
            .get_mut(&id)
            .ok_or(ConvoyError::NodeNotRegistered { node_id: id })?;
        record.assigned_agents.insert(uri.clone());
        Ok(())
    }

    async fn record_agent_stopped(&self, id: NodeId, uri: &AgentUri) -> Result<()> {
        self.check_online("record_agent_stopped")?;
        if let Some(record) = self.state.write().nodes.get_mut(&id) {
            record.assigned_agents.remove(uri);
        }
        Ok(())
    }
}
