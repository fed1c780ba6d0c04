//! Graceful shutdown handling
//!
//! Watch-based shutdown signaling. The signal is sticky: a loop that starts
//! listening after shutdown was triggered still observes it.

use std::sync::Arc;
use tokio::sync::watch;

/// Shutdown signal shared by every loop of a node
///
/// Clone the signal for distribution; every clone observes the same trigger.
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // Only errors if the sender is gone, and we hold it
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
