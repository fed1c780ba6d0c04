//! Convoy Core - cluster coordination for long-running agents
//!
//! This crate lets a set of service nodes:
//! - Elect a single leader through a shared liveness store
//! - Distribute agents evenly across nodes
//! - Evict nodes that stop heartbeating
//! - Continuously correct drift between desired and actual placement

pub mod agent;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod node;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use agent::{Agent, AgentFamily, AgentUri, FamilyRegistry};
pub use coordinator::{ClusterConfig, Command, DurabilityMode, NodeId};
pub use error::{ConvoyError, Result};
pub use node::ClusterNode;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default staleness threshold in seconds
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 30;
