//! Agent families and the scheme registry
//!
//! A family provides one class of agents, keyed by URI scheme. Families are
//! registered explicitly at startup and held for the process lifetime.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::uri::AgentUri;
use crate::coordinator::grid::AssignmentGrid;
use crate::error::{ConvoyError, Result};

/// Lifecycle status reported by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Built but not started
    Idle,
    /// Doing work
    Running,
    /// Stopped by request
    Stopped,
    /// Stopped on its own after an error
    Faulted,
}

/// A unit of long-running background work
#[async_trait]
pub trait Agent: Send + Sync {
    /// Address of this agent
    fn uri(&self) -> &AgentUri;

    /// Begin work. Must return once the agent is running, not when it finishes.
    async fn start(&self) -> Result<()>;

    /// Finish any in-flight unit of work and stop
    async fn stop(&self) -> Result<()>;

    /// Current lifecycle status
    fn status(&self) -> AgentStatus;
}

/// Provider of one class of agents
#[async_trait]
pub trait AgentFamily: Send + Sync {
    /// URI scheme owned by this family
    fn scheme(&self) -> &str;

    /// Every agent this family could ever run, independent of cluster size
    async fn all_known_agents(&self) -> Result<BTreeSet<AgentUri>>;

    /// Agents this node is able to host
    async fn supported_agents(&self) -> Result<BTreeSet<AgentUri>> {
        self.all_known_agents().await
    }

    /// Express the desired distribution of this family's agents on the grid
    async fn evaluate_assignments(&self, grid: &mut AssignmentGrid) -> Result<()> {
        grid.distribute_evenly(self.scheme());
        Ok(())
    }

    /// Materialize an agent. Only called on the node that will run it.
    async fn build_agent(&self, uri: &AgentUri) -> Result<Arc<dyn Agent>>;
}

/// Explicit scheme → family registry
#[derive(Default, Clone)]
pub struct FamilyRegistry {
    families: BTreeMap<String, Arc<dyn AgentFamily>>,
}

impl FamilyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a family; a scheme may only be registered once
    pub fn register(&mut self, family: Arc<dyn AgentFamily>) -> Result<()> {
        let scheme = family.scheme().to_string();
        if self.families.contains_key(&scheme) {
            return Err(ConvoyError::DuplicateScheme { scheme });
        }
        info!("Registered agent family for scheme '{}'", scheme);
        self.families.insert(scheme, family);
        Ok(())
    }

    /// Builder-style registration
    pub fn with(mut self, family: Arc<dyn AgentFamily>) -> Result<Self> {
        self.register(family)?;
        Ok(self)
    }

    pub fn find(&self, scheme: &str) -> Option<&Arc<dyn AgentFamily>> {
        self.families.get(scheme)
    }

    /// Family owning the URI's scheme
    pub fn for_uri(&self, uri: &AgentUri) -> Result<&Arc<dyn AgentFamily>> {
        self.find(uri.scheme()).ok_or_else(|| ConvoyError::UnknownScheme {
            scheme: uri.scheme().to_string(),
        })
    }

    pub fn families(&self) -> impl Iterator<Item = &Arc<dyn AgentFamily>> {
        self.families.values()
    }

    pub fn schemes(&self) -> Vec<String> {
        self.families.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Union of every family's known agents
    pub async fn all_known_agents(&self) -> Result<BTreeSet<AgentUri>> {
        let mut all = BTreeSet::new();
        for family in self.families.values() {
            let known = family.all_known_agents().await?;
            debug!("Family '{}' knows {} agents", family.scheme(), known.len());
            all.extend(known);
        }
        Ok(all)
    }

    /// Union of every family's locally supported agents
    pub async fn supported_agents(&self) -> Result<BTreeSet<AgentUri>> {
        let mut all = BTreeSet::new();
        for family in self.families.values() {
            all.extend(family.supported_agents().await?);
        }
        Ok(all)
    }
}
