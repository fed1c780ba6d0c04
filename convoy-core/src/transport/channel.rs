//! Command channel contract and delivery retry

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::coordinator::command::Command;
use crate::coordinator::membership::ControlAddress;
use crate::error::Result;
use crate::metrics::standard;

/// Inbound commands for one node
pub type CommandInbox = mpsc::Receiver<Command>;

/// Outbound side of the command transport, owned by one node
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Address peers use to reach this node
    fn local_address(&self) -> &ControlAddress;

    /// Deliver a command to the node listening on `address`
    async fn send(&self, address: &ControlAddress, command: Command) -> Result<()>;

    /// Put a command on this node's own inbox
    async fn enqueue_locally(&self, command: Command) -> Result<()>;
}

/// Retry policy for command delivery
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles every attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Send with exponential backoff on retryable failures
pub async fn send_with_retry(
    channel: &dyn CommandChannel,
    address: &ControlAddress,
    command: Command,
    policy: RetryPolicy,
) -> Result<()> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let result = if address == channel.local_address() {
            channel.enqueue_locally(command.clone()).await
        } else {
            channel.send(address, command.clone()).await
        };

        match result {
            Ok(()) => {
                standard::COMMANDS_SENT.inc();
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                warn!(
                    "Delivery of {} to {} failed (attempt {}/{}): {}",
                    command,
                    address,
                    attempt + 1,
                    attempts,
                    e
                );
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                standard::COMMAND_FAILURES.inc();
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }
}
