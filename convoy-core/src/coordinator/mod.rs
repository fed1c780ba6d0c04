//! Cluster coordination
//!
//! Membership, leader election, eviction of silent nodes and reconciliation
//! of agent placement.

pub mod command;
pub mod config;
pub mod grid;
pub mod health;
pub mod leader;
pub mod membership;
pub mod reconciler;
pub mod tracker;

pub use command::{Command, CommandTarget, VerifyScope};
pub use config::{ClusterConfig, DurabilityMode};
pub use grid::{AssignmentChange, AssignmentGrid};
pub use health::HealthMonitor;
pub use leader::{LeaderElector, Role};
pub use membership::{ControlAddress, Node, NodeId, NodeRecord};
pub use reconciler::{AssignmentReconciler, AssignmentReport, CommandFailure};
pub use tracker::{ClusterEvent, ExitReason, NodeEventKind, Tracker, TrackerSnapshot};
