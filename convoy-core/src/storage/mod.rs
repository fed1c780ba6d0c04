//! Liveness storage
//!
//! The shared persistence substrate recording which nodes are alive, which
//! agents they run, and who holds leadership.

pub mod liveness;
pub mod memory;

pub use liveness::LivenessStore;
pub use memory::InMemoryLivenessStore;
