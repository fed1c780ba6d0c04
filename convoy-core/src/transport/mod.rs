//! Command transport
//!
//! Point-to-point delivery of [`Command`](crate::coordinator::Command)s to a
//! node's control address.

pub mod channel;
pub mod memory;

pub use channel::{send_with_retry, CommandChannel, CommandInbox, RetryPolicy};
pub use memory::{InMemoryCommandChannel, InMemoryCommandHub};
