//! Cluster state tracker
//!
//! The local node's view of membership, agent ownership and leadership.
//! State changes only by applying [`ClusterEvent`]s, and every applied event
//! is re-published to subscribers in application order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use super::membership::{ControlAddress, Node, NodeId, NodeRecord};
use crate::agent::AgentUri;
use crate::error::{ConvoyError, Result};

/// Per-subscriber buffer; slow subscribers lose the oldest events
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events kept for operators
const HISTORY_LIMIT: usize = 256;

/// Why a node left the tracker's view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Node stopped and deleted its own record
    Graceful,
    /// Health monitor removed a stale node
    Evicted,
    /// Record disappeared from the liveness store
    Vanished,
}

/// Discrete state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    NodeJoined {
        node: NodeId,
        control_address: ControlAddress,
        last_seen: DateTime<Utc>,
    },
    NodeExited {
        node: NodeId,
        reason: ExitReason,
    },
    AgentStarted {
        uri: AgentUri,
        node: NodeId,
    },
    AgentStopped {
        uri: AgentUri,
        node: NodeId,
    },
    LeadershipChanged {
        leader: Option<NodeId>,
    },
}

impl ClusterEvent {
    pub fn node_joined(node: NodeId, control_address: ControlAddress) -> Self {
        ClusterEvent::NodeJoined {
            node,
            control_address,
            last_seen: Utc::now(),
        }
    }

    pub fn node_event_kind(&self) -> Option<NodeEventKind> {
        match self {
            ClusterEvent::NodeJoined { .. } => Some(NodeEventKind::Joined),
            ClusterEvent::NodeExited { .. } => Some(NodeEventKind::Exited),
            _ => None,
        }
    }
}

/// Node event filter for [`Tracker::wait_for_node_event`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    Joined,
    Exited,
}

/// Point-in-time copy of tracker state
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerSnapshot {
    pub nodes: BTreeMap<NodeId, Node>,
    pub agents: BTreeMap<AgentUri, NodeId>,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
}

impl TrackerSnapshot {
    /// Agents the tracker attributes to a node
    pub fn agents_on(&self, node: NodeId) -> BTreeSet<AgentUri> {
        self.agents
            .iter()
            .filter(|(_, owner)| **owner == node)
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// Agent count per known node
    pub fn agent_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts: BTreeMap<NodeId, usize> = self.nodes.keys().map(|&id| (id, 0)).collect();
        for owner in self.agents.values() {
            *counts.entry(*owner).or_default() += 1;
        }
        counts
    }
}

struct TrackerState {
    view: TrackerSnapshot,
    history: VecDeque<ClusterEvent>,
}

/// Event-sourced in-memory cluster view owned by one node
pub struct Tracker {
    local: NodeId,
    state: Mutex<TrackerState>,
    sender: broadcast::Sender<ClusterEvent>,
}

impl Tracker {
    /// Create a tracker for the local node
    pub fn new(local: NodeId) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            local,
            state: Mutex::new(TrackerState {
                view: TrackerSnapshot::default(),
                history: VecDeque::with_capacity(HISTORY_LIMIT),
            }),
            sender,
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local
    }

    /// Apply an event and publish it
    pub fn apply(&self, event: ClusterEvent) {
        let mut state = self.state.lock();
        self.apply_locked(&mut state, event);
    }

    // Mutation and publication happen under one lock, which is what gives
    // subscribers the application order.
    fn apply_locked(&self, state: &mut TrackerState, event: ClusterEvent) {
        let view = &mut state.view;
        match &event {
            ClusterEvent::NodeJoined { node, control_address, last_seen } => {
                let entry = view
                    .nodes
                    .entry(*node)
                    .or_insert_with(|| Node::new(*node, control_address.clone()));
                entry.control_address = control_address.clone();
                entry.last_seen = *last_seen;
            }
            ClusterEvent::NodeExited { node, reason } => {
                view.nodes.remove(node);
                view.agents.retain(|_, owner| owner != node);
                if view.leader_id == Some(*node) && *node != self.local {
                    debug!("Believed leader {} exited ({:?})", node, reason);
                }
            }
            ClusterEvent::AgentStarted { uri, node } => {
                if let Some(previous) = view.agents.insert(uri.clone(), *node) {
                    if previous != *node {
                        if let Some(prev) = view.nodes.get_mut(&previous) {
                            prev.assigned_agents.remove(uri);
                        }
                    }
                }
                if let Some(owner) = view.nodes.get_mut(node) {
                    owner.assigned_agents.insert(uri.clone());
                }
            }
            ClusterEvent::AgentStopped { uri, node } => {
                if view.agents.get(uri) == Some(node) {
                    view.agents.remove(uri);
                }
                if let Some(owner) = view.nodes.get_mut(node) {
                    owner.assigned_agents.remove(uri);
                }
            }
            ClusterEvent::LeadershipChanged { leader } => {
                let was_leader = view.is_leader;
                view.leader_id = *leader;
                view.is_leader = *leader == Some(self.local);
                if was_leader != view.is_leader {
                    info!(
                        node_id = %self.local,
                        "Leadership {}",
                        if view.is_leader { "assumed" } else { "lost" }
                    );
                }
            }
        }

        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());

        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    /// Bring the view in line with a liveness store listing
    ///
    /// Agent ownership of the local node is left alone; the agent controller
    /// is the authority for what runs here. Returns the applied events.
    pub fn sync_from_records(&self, records: &[NodeRecord]) -> Vec<ClusterEvent> {
        let mut state = self.state.lock();
        let mut events = Vec::new();

        let listed: BTreeSet<NodeId> = records.iter().map(|r| r.id).collect();
        for record in records {
            if !state.view.nodes.contains_key(&record.id) {
                events.push(ClusterEvent::NodeJoined {
                    node: record.id,
                    control_address: record.control_address.clone(),
                    last_seen: record.last_seen,
                });
            }
        }
        for node in state.view.nodes.keys() {
            if !listed.contains(node) && *node != self.local {
                events.push(ClusterEvent::NodeExited {
                    node: *node,
                    reason: ExitReason::Vanished,
                });
            }
        }

        let mut sorted: Vec<&NodeRecord> = records.iter().collect();
        sorted.sort_by_key(|r| r.id);
        let mut owners: BTreeMap<&AgentUri, NodeId> = BTreeMap::new();
        for record in sorted {
            for uri in &record.assigned_agents {
                owners.entry(uri).or_insert(record.id);
            }
        }

        for (uri, owner) in &owners {
            let tracked = state.view.agents.get(*uri).copied();
            if *owner == self.local || tracked == Some(self.local) {
                continue;
            }
            if tracked != Some(*owner) {
                events.push(ClusterEvent::AgentStarted {
                    uri: (*uri).clone(),
                    node: *owner,
                });
            }
        }
        for (uri, owner) in &state.view.agents {
            if *owner != self.local && !owners.contains_key(uri) && listed.contains(owner) {
                events.push(ClusterEvent::AgentStopped {
                    uri: uri.clone(),
                    node: *owner,
                });
            }
        }

        for event in &events {
            self.apply_locked(&mut state, event.clone());
        }
        if !events.is_empty() {
            debug!("Tracker sync applied {} events", events.len());
        }
        events
    }

    /// Receive every event applied from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.state.lock().view.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().view.is_leader
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.state.lock().view.leader_id
    }

    /// Agents the tracker attributes to the local node
    pub fn running_agents(&self) -> BTreeSet<AgentUri> {
        self.state.lock().view.agents_on(self.local)
    }

    pub fn agent_owner(&self, uri: &AgentUri) -> Option<NodeId> {
        self.state.lock().view.agents.get(uri).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.state.lock().view.nodes.get(&id).cloned()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.state.lock().view.nodes.keys().copied().collect()
    }

    /// Most recent events, oldest first
    pub fn recent_events(&self) -> Vec<ClusterEvent> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Wait until the predicate holds on the tracker state
    pub async fn wait_for<F>(&self, description: &str, timeout: Duration, predicate: F) -> Result<TrackerSnapshot>
    where
        F: Fn(&TrackerSnapshot) -> bool,
    {
        // Subscribe before checking so no event slips between check and wait
        let mut events = self.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            let snapshot = self.snapshot();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(ConvoyError::timeout(description, timeout)),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(ConvoyError::Internal {
                        message: "tracker event channel closed".into(),
                    })
                }
            }
        }
    }

    /// Wait until the local node is leader
    pub async fn wait_for_leadership(&self, timeout: Duration) -> Result<()> {
        self.wait_for("leadership", timeout, |s| s.is_leader).await.map(|_| ())
    }

    /// Wait for the next node event of the given kind
    pub async fn wait_for_node_event(&self, kind: NodeEventKind, timeout: Duration) -> Result<ClusterEvent> {
        let mut events = self.subscribe();
        let deadline = Instant::now() + timeout;
        let condition = format!("node event {:?}", kind);

        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Err(ConvoyError::timeout(condition, timeout)),
                Ok(Ok(event)) if event.node_event_kind() == Some(kind) => return Ok(event),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(ConvoyError::Internal {
                        message: "tracker event channel closed".into(),
                    })
                }
            }
        }
    }
}
