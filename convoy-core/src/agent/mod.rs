//! Agents and their lifecycle
//!
//! Addressing, the family registry that materializes agents, and the per-node
//! controller that starts and stops them.

pub mod controller;
pub mod family;
pub mod uri;

pub use controller::{AgentController, LocalVerifyReport};
pub use family::{Agent, AgentFamily, AgentStatus, FamilyRegistry};
pub use uri::AgentUri;
