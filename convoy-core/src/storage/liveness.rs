//! Liveness store contract
//!
//! Implementations map node records and the leadership claim onto a concrete
//! database. Every write must be safely repeatable: callers retry on the next
//! timer tick and assume at-least-once semantics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::agent::AgentUri;
use crate::coordinator::membership::{NodeId, NodeRecord};
use crate::error::Result;

#[async_trait]
pub trait LivenessStore: Send + Sync {
    /// Allocate a node number that has never been handed out before
    async fn next_node_id(&self) -> Result<NodeId>;

    /// Insert the record of a starting node
    async fn insert_node(&self, record: NodeRecord) -> Result<()>;

    /// Remove a node's record; also clears its leadership claim
    async fn delete_node(&self, id: NodeId) -> Result<()>;

    /// Refresh `last_seen`. Fails with `NodeNotRegistered` once the record is gone.
    async fn heartbeat(&self, id: NodeId, timestamp: DateTime<Utc>) -> Result<()>;

    /// All records, ordered by node id
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;

    async fn find_node(&self, id: NodeId) -> Result<Option<NodeRecord>>;

    /// Records whose last heartbeat is older than the cutoff
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<NodeRecord>>;

    /// Claim leadership if nobody holds it. True if `id` holds it afterwards.
    async fn try_claim_leadership(&self, id: NodeId) -> Result<bool>;

    /// Take leadership from `stale` only if `stale` still holds it
    async fn try_supersede_leader(&self, id: NodeId, stale: NodeId) -> Result<bool>;

    /// Give up leadership if `id` holds it
    async fn release_leadership(&self, id: NodeId) -> Result<()>;

    async fn load_leader(&self) -> Result<Option<NodeId>>;

    /// Note that the node now runs the agent
    async fn record_agent_started(&self, id: NodeId, uri: &AgentUri) -> Result<()>;

    /// Note that the node no longer runs the agent; no-op for unknown nodes
    async fn record_agent_stopped(&self, id: NodeId, uri: &AgentUri) -> Result<()>;
}
