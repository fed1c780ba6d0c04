//! In-memory command hub
//!
//! Routes commands between nodes of one process. Commands cross the hub as
//! JSON bytes so the wire shape is exercised the same way a network transport
//! would exercise it.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::channel::{CommandChannel, CommandInbox};
use crate::coordinator::command::Command;
use crate::coordinator::membership::ControlAddress;
use crate::error::{ConvoyError, Result};

/// Inbox depth per node
const INBOX_CAPACITY: usize = 1024;

#[derive(Default)]
struct HubState {
    routes: BTreeMap<ControlAddress, mpsc::Sender<Command>>,
    unreachable: BTreeSet<ControlAddress>,
}

/// Shared router for every node of an in-process cluster
#[derive(Default, Clone)]
pub struct InMemoryCommandHub {
    state: Arc<RwLock<HubState>>,
}

impl InMemoryCommandHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node at `address`, replacing any previous listener there
    pub fn connect(&self, address: ControlAddress) -> (Arc<InMemoryCommandChannel>, CommandInbox) {
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);
        self.state.write().routes.insert(address.clone(), sender);
        debug!("Connected {} to command hub", address);

        let channel = Arc::new(InMemoryCommandChannel {
            hub: self.clone(),
            address,
        });
        (channel, inbox)
    }

    /// Detach a node; later sends to it fail with `UnknownAddress`
    pub fn disconnect(&self, address: &ControlAddress) {
        self.state.write().routes.remove(address);
    }

    /// Simulate a network partition towards one node
    pub fn set_unreachable(&self, address: &ControlAddress, unreachable: bool) {
        let mut state = self.state.write();
        if unreachable {
            state.unreachable.insert(address.clone());
        } else {
            state.unreachable.remove(address);
        }
    }

    pub fn addresses(&self) -> Vec<ControlAddress> {
        self.state.read().routes.keys().cloned().collect()
    }

    async fn deliver(&self, address: &ControlAddress, command: &Command) -> Result<()> {
        let sender = {
            let state = self.state.read();
            if state.unreachable.contains(address) {
                return Err(ConvoyError::DeliveryFailed {
                    address: address.to_string(),
                    reason: "address unreachable".into(),
                });
            }
            state
                .routes
                .get(address)
                .cloned()
                .ok_or_else(|| ConvoyError::UnknownAddress {
                    address: address.to_string(),
                })?
        };

        let decoded = Command::decode(&command.encode()?)?;
        sender
            .send(decoded)
            .await
            .map_err(|_| ConvoyError::DeliveryFailed {
                address: address.to_string(),
                reason: "inbox closed".into(),
            })
    }
}

/// One node's handle on the hub
pub struct InMemoryCommandChannel {
    hub: InMemoryCommandHub,
    address: ControlAddress,
}

#[async_trait]
impl CommandChannel for InMemoryCommandChannel {
    fn local_address(&self) -> &ControlAddress {
        &self.address
    }

    async fn send(&self, address: &ControlAddress, command: Command) -> Result<()> {
        debug!("Sending {} from {} to {}", command, self.address, address);
        self.hub.deliver(address, &command).await
    }

    async fn enqueue_locally(&self, command: Command) -> Result<()> {
        self.hub.deliver(&self.address, &command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentUri;
    use crate::transport::channel::{send_with_retry, RetryPolicy};
    use std::time::Duration;

    #[tokio::test]
    async fn test_point_to_point_delivery() {
        let hub = InMemoryCommandHub::new();
        let (a, _inbox_a) = hub.connect(ControlAddress::new("mem://a"));
        let (_b, mut inbox_b) = hub.connect(ControlAddress::new("mem://b"));

        let cmd = Command::StartAgent { uri: AgentUri::parse("fake://one").unwrap() };
        a.send(&ControlAddress::new("mem://b"), cmd.clone()).await.unwrap();
        assert_eq!(inbox_b.recv().await.unwrap(), cmd);
    }

    #[tokio::test]
    async fn test_enqueue_locally() {
        let hub = InMemoryCommandHub::new();
        let (a, mut inbox) = hub.connect(ControlAddress::new("mem://a"));
        a.enqueue_locally(Command::RunHealthCheck).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap(), Command::RunHealthCheck);
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let hub = InMemoryCommandHub::new();
        let (a, _inbox) = hub.connect(ControlAddress::new("mem://a"));
        let err = a.send(&ControlAddress::new("mem://nowhere"), Command::RunHealthCheck).await.unwrap_err();
        assert!(matches!(err, ConvoyError::UnknownAddress { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_partition() {
        let hub = InMemoryCommandHub::new();
        let (a, _inbox_a) = hub.connect(ControlAddress::new("mem://a"));
        let (_b, _inbox_b) = hub.connect(ControlAddress::new("mem://b"));
        hub.set_unreachable(&ControlAddress::new("mem://b"), true);

        let policy = RetryPolicy { max_attempts: 2, base_delay: Duration::from_millis(1) };
        let err = send_with_retry(a.as_ref(), &ControlAddress::new("mem://b"), Command::RunHealthCheck, policy)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::DeliveryFailed { .. }));
    }
}
