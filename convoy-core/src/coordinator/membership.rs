//! Node membership types
//!
//! Identity, addressing and the liveness record of a participating node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::agent::AgentUri;

/// Cluster-unique node number, allocated by the liveness store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address a node receives commands on
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControlAddress(String);

impl ControlAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liveness record persisted for every active node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node number
    pub id: NodeId,
    /// Process incarnation
    pub instance: Uuid,
    /// Where commands for this node are sent
    pub control_address: ControlAddress,
    /// Agents this node is able to host
    pub capabilities: BTreeSet<AgentUri>,
    /// Agents the node reports as running
    pub assigned_agents: BTreeSet<AgentUri>,
    /// When the record was inserted
    pub started_at: DateTime<Utc>,
    /// Last successful heartbeat
    pub last_seen: DateTime<Utc>,
}

impl NodeRecord {
    /// Fresh record for a starting node
    pub fn new(id: NodeId, control_address: ControlAddress, capabilities: BTreeSet<AgentUri>) -> Self {
        let now = Utc::now();
        Self {
            id,
            instance: Uuid::new_v4(),
            control_address,
            capabilities,
            assigned_agents: BTreeSet::new(),
            started_at: now,
            last_seen: now,
        }
    }

    /// Whether the node is able to host the agent
    pub fn supports(&self, uri: &AgentUri) -> bool {
        self.capabilities.contains(uri)
    }

    /// Whether the last heartbeat is older than the cutoff
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_seen < cutoff
    }
}

/// Heartbeats older than this instant mark a node stale
pub fn stale_cutoff(threshold: Duration) -> DateTime<Utc> {
    let threshold = chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::weeks(52));
    Utc::now() - threshold
}

/// A node as seen by the local tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub control_address: ControlAddress,
    pub assigned_agents: BTreeSet<AgentUri>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    pub fn new(id: NodeId, control_address: ControlAddress) -> Self {
        Self {
            id,
            control_address,
            assigned_agents: BTreeSet::new(),
            last_seen: Utc::now(),
        }
    }
}

impl From<&NodeRecord> for Node {
    fn from(record: &NodeRecord) -> Self {
        Self {
            id: record.id,
            control_address: record.control_address.clone(),
            assigned_agents: record.assigned_agents.clone(),
            last_seen: record.last_seen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_staleness_against_cutoff() {
        let mut record = NodeRecord::new(NodeId(1), ControlAddress::new("mem://1"), BTreeSet::new());
        let now = Utc::now();
        record.last_seen = now - Duration::seconds(30);

        assert!(record.is_stale(now - Duration::seconds(10)));
        assert!(!record.is_stale(now - Duration::seconds(60)));
    }

    #[test]
    fn test_supports_uses_capabilities() {
        let uri = AgentUri::parse("fake://one").unwrap();
        let record = NodeRecord::new(
            NodeId(1),
            ControlAddress::new("mem://1"),
            [uri.clone()].into_iter().collect(),
        );
        assert!(record.supports(&uri));
        assert!(!record.supports(&AgentUri::parse("fake://two").unwrap()));
    }
}
