//! Assignment grid
//!
//! Desired agent placement, rebuilt from scratch on every reconciliation
//! cycle from node membership and the families' distribution policies.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::membership::{NodeId, NodeRecord};
use crate::agent::AgentUri;
use crate::error::{ConvoyError, Result};

#[derive(Debug, Clone, Default)]
struct GridNode {
    capabilities: BTreeSet<AgentUri>,
}

#[derive(Debug, Clone, Default)]
struct GridAgent {
    /// Nodes currently running the agent; more than one means a duplicate
    current: BTreeSet<NodeId>,
    desired: Option<NodeId>,
    pinned: bool,
    /// Reported by a family in this cycle
    known: bool,
}

/// Correction needed to move one agent to its desired node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentChange {
    pub uri: AgentUri,
    /// Current owners that must stop the agent
    pub stop_on: Vec<NodeId>,
    /// Desired owner that must start it, if not already running there
    pub start_on: Option<NodeId>,
}

/// Per-cycle snapshot of current and desired agent placement
#[derive(Debug, Clone, Default)]
pub struct AssignmentGrid {
    nodes: BTreeMap<NodeId, GridNode>,
    agents: BTreeMap<AgentUri, GridAgent>,
}

impl AssignmentGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a grid from liveness records: nodes, capabilities and current owners
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a NodeRecord>) -> Self {
        let mut grid = Self::new();
        let mut records: Vec<&NodeRecord> = records.into_iter().collect();
        records.sort_by_key(|r| r.id);

        for record in &records {
            grid.add_node(record.id, record.capabilities.iter().cloned());
        }
        for record in &records {
            for uri in &record.assigned_agents {
                grid.record_current(uri.clone(), record.id);
            }
        }
        grid
    }

    /// Add an active node and the agents it can host
    pub fn add_node(&mut self, node: NodeId, capabilities: impl IntoIterator<Item = AgentUri>) {
        self.nodes.entry(node).or_default().capabilities.extend(capabilities);
    }

    /// Note that `node` currently runs `uri`
    ///
    /// The first recorded owner becomes the default desired owner, so agents
    /// no policy touches stay where they are.
    pub fn record_current(&mut self, uri: AgentUri, node: NodeId) {
        let agent = self.agents.entry(uri).or_default();
        agent.current.insert(node);
        if agent.desired.is_none() && self.nodes.contains_key(&node) {
            agent.desired = Some(node);
        }
    }

    /// Mark an agent as part of the known universe for this cycle
    pub fn add_known_agent(&mut self, uri: AgentUri) {
        self.agents.entry(uri).or_default().known = true;
    }

    pub fn add_known_agents(&mut self, uris: impl IntoIterator<Item = AgentUri>) {
        for uri in uris {
            self.add_known_agent(uri);
        }
    }

    /// Active node ids in ascending order
    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn supports(&self, node: NodeId, uri: &AgentUri) -> bool {
        self.nodes
            .get(&node)
            .map(|n| n.capabilities.contains(uri))
            .unwrap_or(false)
    }

    /// Known agents of a scheme in deterministic order
    pub fn agents_for_scheme(&self, scheme: &str) -> Vec<AgentUri> {
        self.agents
            .iter()
            .filter(|(uri, agent)| agent.known && uri.scheme() == scheme)
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    pub fn current_owners(&self, uri: &AgentUri) -> Vec<NodeId> {
        self.agents
            .get(uri)
            .map(|a| a.current.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn desired_owner(&self, uri: &AgentUri) -> Option<NodeId> {
        self.agents.get(uri).and_then(|a| a.desired)
    }

    /// Set the desired owner of a known agent
    pub fn assign(&mut self, uri: &AgentUri, node: NodeId) -> Result<()> {
        if !self.nodes.contains_key(&node) {
            return Err(ConvoyError::NodeNotRegistered { node_id: node });
        }
        match self.agents.get_mut(uri) {
            Some(agent) if agent.known => {
                agent.desired = Some(node);
                Ok(())
            }
            _ => Err(ConvoyError::UnknownAgent { uri: uri.clone() }),
        }
    }

    /// Fix an agent to a node and exclude it from balancing
    pub fn pin(&mut self, uri: &AgentUri, node: NodeId) -> Result<()> {
        self.assign(uri, node)?;
        if let Some(agent) = self.agents.get_mut(uri) {
            agent.pinned = true;
        }
        Ok(())
    }

    /// Clear the desired owner of an agent
    pub fn unassign(&mut self, uri: &AgentUri) {
        if let Some(agent) = self.agents.get_mut(uri) {
            agent.desired = None;
            agent.pinned = false;
        }
    }

    /// Spread a scheme's unpinned agents evenly over the nodes able to host them
    ///
    /// Each node ends up with ⌊K/N⌋ or ⌈K/N⌉ agents. Agents already on a node
    /// with room stay there; only the surplus and the unassigned move. On an
    /// empty grid this is `agents[i] → nodes[i mod N]`.
    pub fn distribute_evenly(&mut self, scheme: &str) {
        let agents: Vec<AgentUri> = self
            .agents
            .iter()
            .filter(|(uri, a)| a.known && !a.pinned && uri.scheme() == scheme)
            .map(|(uri, _)| uri.clone())
            .collect();
        if agents.is_empty() {
            return;
        }

        let eligible: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| agents.iter().any(|uri| n.capabilities.contains(uri)))
            .map(|(id, _)| *id)
            .collect();

        if eligible.is_empty() {
            warn!("No node can host any '{}' agent, {} left unassigned", scheme, agents.len());
            for uri in &agents {
                self.unassign(uri);
            }
            return;
        }

        let targets = self.targets(&agents, &eligible);
        let mut load: BTreeMap<NodeId, usize> = eligible.iter().map(|&id| (id, 0)).collect();
        let mut pool = Vec::new();

        // Keep agents where they are while their owner has room
        for uri in &agents {
            let current = self.agents[uri].current.clone();
            let keeper = current.into_iter().find(|node| {
                self.supports(*node, uri)
                    && match (load.get(node), targets.get(node)) {
                        (Some(held), Some(target)) => held < target,
                        _ => false,
                    }
            });
            match keeper {
                Some(node) => {
                    *load.entry(node).or_default() += 1;
                    self.set_desired(uri, Some(node));
                }
                None => pool.push(uri.clone()),
            }
        }

        // Most constrained agents first so they still find a supporting node
        pool.sort_by_cached_key(|uri| eligible.iter().filter(|node| self.supports(**node, uri)).count());

        // Deal the rest round-robin to nodes below target
        let mut cursor = 0;
        for uri in pool {
            let slot = (0..eligible.len())
                .map(|offset| (cursor + offset) % eligible.len())
                .find(|&idx| {
                    let node = eligible[idx];
                    load[&node] < targets[&node] && self.supports(node, &uri)
                });

            let chosen = match slot {
                Some(idx) => {
                    cursor = idx + 1;
                    Some(eligible[idx])
                }
                None => eligible
                    .iter()
                    .copied()
                    .filter(|node| self.supports(*node, &uri))
                    .min_by_key(|node| (load[node], *node)),
            };

            match chosen {
                Some(node) => {
                    *load.entry(node).or_default() += 1;
                    self.set_desired(&uri, Some(node));
                }
                None => {
                    warn!("No node supports agent {}, leaving it unassigned", uri);
                    self.set_desired(&uri, None);
                }
            }
        }

        debug!(
            "Distributed {} '{}' agents over {} nodes",
            agents.len(),
            scheme,
            eligible.len()
        );
    }

    /// Per-node targets; the ⌈K/N⌉ slots go to nodes already holding the most
    fn targets(&self, agents: &[AgentUri], eligible: &[NodeId]) -> BTreeMap<NodeId, usize> {
        let base = agents.len() / eligible.len();
        let extra = agents.len() % eligible.len();

        let held = |node: NodeId| {
            agents
                .iter()
                .filter(|uri| self.agents[*uri].current.contains(&node))
                .count()
        };

        let mut ranked: Vec<(usize, NodeId)> = eligible.iter().map(|&id| (held(id), id)).collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        ranked
            .into_iter()
            .enumerate()
            .map(|(rank, (_, id))| (id, if rank < extra { base + 1 } else { base }))
            .collect()
    }

    fn set_desired(&mut self, uri: &AgentUri, node: Option<NodeId>) {
        if let Some(agent) = self.agents.get_mut(uri) {
            agent.desired = node;
        }
    }

    /// Known agents with no desired owner
    pub fn unassigned(&self) -> Vec<AgentUri> {
        self.agents
            .iter()
            .filter(|(_, a)| a.known && a.desired.is_none())
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// Desired agent count per node, including nodes with none
    pub fn desired_counts(&self) -> BTreeMap<NodeId, usize> {
        let mut counts: BTreeMap<NodeId, usize> = self.nodes.keys().map(|&id| (id, 0)).collect();
        for agent in self.agents.values().filter(|a| a.known) {
            if let Some(node) = agent.desired {
                *counts.entry(node).or_default() += 1;
            }
        }
        counts
    }

    /// Diff desired placement against current placement
    ///
    /// Agents no family reported are stopped everywhere they run.
    pub fn changes(&self) -> Vec<AssignmentChange> {
        self.agents
            .iter()
            .filter_map(|(uri, agent)| {
                let desired = if agent.known { agent.desired } else { None };
                let stop_on: Vec<NodeId> = agent
                    .current
                    .iter()
                    .copied()
                    .filter(|node| Some(*node) != desired)
                    .collect();
                let start_on = desired.filter(|node| !agent.current.contains(node));

                if stop_on.is_empty() && start_on.is_none() {
                    None
                } else {
                    Some(AssignmentChange {
                        uri: uri.clone(),
                        stop_on,
                        start_on,
                    })
                }
            })
            .collect()
    }
}
