//! Error types for Convoy coordination
//!
//! Error taxonomy covering the liveness store, the command channel,
//! leadership, agent lifecycle and configuration.

use std::time::Duration;
use thiserror::Error;

use crate::agent::AgentUri;
use crate::coordinator::NodeId;

/// Primary error type for all coordination operations
#[derive(Debug, Error)]
pub enum ConvoyError {
    // ========== Storage Errors ==========

    /// Liveness store operation failed
    #[error("Liveness store operation failed: {message}")]
    StorageError { message: String },

    /// Node has no liveness record (never inserted, or evicted)
    #[error("Node {node_id} not registered")]
    NodeNotRegistered { node_id: NodeId },

    /// Node already holds a liveness record
    #[error("Node {node_id} already registered")]
    NodeAlreadyRegistered { node_id: NodeId },

    // ========== Channel Errors ==========

    /// Command could not be delivered
    #[error("Command delivery to {address} failed: {reason}")]
    DeliveryFailed { address: String, reason: String },

    /// No node listens on the control address
    #[error("Unknown control address: {address}")]
    UnknownAddress { address: String },

    /// Invalid message format
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    // ========== Coordination Errors ==========

    /// Operation requires leadership
    #[error("Node {node_id} is not the leader")]
    NotLeader { node_id: NodeId },

    /// Awaited tracker condition was not met in time
    #[error("Timed out after {timeout:?} waiting for {condition}")]
    Timeout { condition: String, timeout: Duration },

    /// Coordination is disabled by the durability mode
    #[error("Coordination disabled in {mode} mode")]
    CoordinationDisabled { mode: String },

    // ========== Agent Errors ==========

    /// Malformed agent URI
    #[error("Invalid agent URI '{uri}': {reason}")]
    InvalidAgentUri { uri: String, reason: String },

    /// No family registered for the scheme
    #[error("No agent family registered for scheme '{scheme}'")]
    UnknownScheme { scheme: String },

    /// Family does not know the agent
    #[error("Unknown agent: {uri}")]
    UnknownAgent { uri: AgentUri },

    /// Two families registered for one scheme
    #[error("Agent family already registered for scheme '{scheme}'")]
    DuplicateScheme { scheme: String },

    /// Agent lifecycle call failed
    #[error("Agent {uri} failed: {reason}")]
    AgentFailed { uri: AgentUri, reason: String },

    // ========== Configuration Errors ==========

    /// Configuration value rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ========== Runtime Errors ==========

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ConvoyError {
    /// Returns true if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConvoyError::StorageError { .. }
                | ConvoyError::DeliveryFailed { .. }
                | ConvoyError::Timeout { .. }
        )
    }

    /// Shorthand for a timeout carrying the unmet condition
    pub fn timeout(condition: impl Into<String>, timeout: Duration) -> Self {
        ConvoyError::Timeout {
            condition: condition.into(),
            timeout,
        }
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, ConvoyError>;
