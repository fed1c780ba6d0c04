//! Leader election
//!
//! Leadership is a conditional claim in the liveness store. A follower claims
//! a vacant seat, or supersedes a holder whose record went stale. There is no
//! quorum: brief double leadership is possible and resolves on the next tick
//! when the loser observes another holder in the store.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::membership::{stale_cutoff, NodeId};
use super::tracker::{ClusterEvent, Tracker};
use crate::error::Result;
use crate::metrics::standard;
use crate::storage::LivenessStore;

/// Election role of the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

/// Promotes the local node to leader and demotes it again
pub struct LeaderElector {
    node_id: NodeId,
    store: Arc<dyn LivenessStore>,
    tracker: Arc<Tracker>,
    stale_threshold: Duration,
}

impl LeaderElector {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn LivenessStore>,
        tracker: Arc<Tracker>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            node_id,
            store,
            tracker,
            stale_threshold,
        }
    }

    pub fn role(&self) -> Role {
        if self.tracker.is_leader() {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    /// Claim a vacant seat. Returns true if this call promoted the node.
    pub async fn try_claim(&self) -> Result<bool> {
        if self.tracker.is_leader() {
            return Ok(false);
        }
        if self.store.try_claim_leadership(self.node_id).await? {
            self.promote();
            return Ok(true);
        }
        Ok(false)
    }

    /// One election round. Returns true if this round promoted the node.
    pub async fn tick(&self) -> Result<bool> {
        let holder = self.store.load_leader().await?;

        if self.tracker.is_leader() {
            if holder != Some(self.node_id) {
                warn!(
                    node_id = %self.node_id,
                    "Leadership held by {:?} in store, stepping down",
                    holder
                );
                self.demote(holder);
            }
            return Ok(false);
        }

        match holder {
            None => self.try_claim().await,
            Some(holder) if holder == self.node_id => {
                // Claim landed but the reply was lost
                self.promote();
                Ok(true)
            }
            Some(holder) => {
                let cutoff = stale_cutoff(self.stale_threshold);
                let stale = match self.store.find_node(holder).await? {
                    Some(record) => record.is_stale(cutoff),
                    None => true,
                };

                if !stale {
                    if self.tracker.leader_id() != Some(holder) {
                        self.tracker.apply(ClusterEvent::LeadershipChanged { leader: Some(holder) });
                    }
                    return Ok(false);
                }

                info!(node_id = %self.node_id, "Leader {} is stale, attempting to supersede", holder);
                if self.store.try_supersede_leader(self.node_id, holder).await? {
                    self.promote();
                    Ok(true)
                } else {
                    debug!("Node {} lost the race to supersede {}", self.node_id, holder);
                    Ok(false)
                }
            }
        }
    }

    /// Demote because this node can no longer prove it is alive
    pub async fn step_down(&self) {
        if !self.tracker.is_leader() {
            return;
        }
        warn!(node_id = %self.node_id, "Stepping down from leadership");
        self.demote(None);
        // Best effort; the store may be what is failing
        if let Err(e) = self.store.release_leadership(self.node_id).await {
            debug!("Release of leadership by {} failed: {}", self.node_id, e);
        }
    }

    /// Give up leadership on graceful shutdown
    pub async fn relinquish(&self) -> Result<()> {
        self.store.release_leadership(self.node_id).await?;
        if self.tracker.is_leader() {
            info!(node_id = %self.node_id, "Relinquished leadership");
            self.demote(None);
        }
        Ok(())
    }

    /// Take leadership without an election (solo mode)
    pub fn assume(&self) {
        if !self.tracker.is_leader() {
            self.promote();
        }
    }

    fn promote(&self) {
        standard::LEADERS.inc();
        self.tracker.apply(ClusterEvent::LeadershipChanged {
            leader: Some(self.node_id),
        });
    }

    fn demote(&self, holder: Option<NodeId>) {
        standard::LEADERS.dec();
        self.tracker.apply(ClusterEvent::LeadershipChanged { leader: holder });
    }
}
