//! Coordination commands
//!
//! The fixed vocabulary the coordination core puts on the command channel.
//! Every command is idempotent because delivery is at-least-once.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::membership::NodeId;
use crate::agent::AgentUri;
use crate::error::{ConvoyError, Result};

/// How far a verify-assignments request reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyScope {
    /// Full reconciliation on the leader, then a local check on every node
    Cluster,
    /// Compare this node's running agents with its liveness record
    Local,
}

/// Instruction addressed to a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Start the agent locally; no-op when already running
    StartAgent { uri: AgentUri },
    /// Stop the agent locally; no-op when not running
    StopAgent { uri: AgentUri },
    /// Evict stale nodes (leader only)
    RunHealthCheck,
    /// Diff-and-correct agent placement
    VerifyAssignments { scope: VerifyScope },
}

impl Command {
    /// Agent the command concerns, if any
    pub fn agent(&self) -> Option<&AgentUri> {
        match self {
            Command::StartAgent { uri } | Command::StopAgent { uri } => Some(uri),
            Command::RunHealthCheck | Command::VerifyAssignments { .. } => None,
        }
    }

    /// Encode for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ConvoyError::InvalidMessage {
            reason: format!("Failed to encode command: {}", e),
        })
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ConvoyError::InvalidMessage {
            reason: format!("Failed to decode command: {}", e),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::StartAgent { uri } => write!(f, "start-agent({})", uri),
            Command::StopAgent { uri } => write!(f, "stop-agent({})", uri),
            Command::RunHealthCheck => write!(f, "run-health-check"),
            Command::VerifyAssignments { scope: VerifyScope::Cluster } => write!(f, "verify-assignments"),
            Command::VerifyAssignments { scope: VerifyScope::Local } => write!(f, "verify-assignments(local)"),
        }
    }
}

/// Where a command should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTarget {
    /// This node
    Local,
    /// A specific node
    Node(NodeId),
    /// Whichever node currently owns the agent
    AgentOwner(AgentUri),
}
