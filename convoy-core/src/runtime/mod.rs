//! Process runtime support
//!
//! Shutdown signaling shared by a node's periodic loops.

pub mod shutdown;

pub use shutdown::ShutdownSignal;
