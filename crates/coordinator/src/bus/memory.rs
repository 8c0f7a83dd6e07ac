//! In-process event bus backed by a tokio broadcast channel.
//!
//! Used for single-process deployments and tests. A lagging subscriber loses
//! the overwritten events, which the periodic resync repairs the same way it
//! repairs lost pub/sub messages.

use super::{EventSubscription, ViewerEventBus, SUBSCRIPTION_BUFFER};
use crate::errors::CoordinatorError;
use crate::events::{topic_matches, ViewerEvent};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Default broadcast ring size.
pub const DEFAULT_CAPACITY: usize = 4096;

/// In-process [`ViewerEventBus`].
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    sender: broadcast::Sender<(String, ViewerEvent)>,
}

impl InMemoryEventBus {
    /// Create a bus with the given broadcast ring size.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl ViewerEventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, event: &ViewerEvent) -> Result<(), CoordinatorError> {
        // No subscribers is not a failure for a broadcast bus.
        let _ = self.sender.send((topic.to_string(), event.clone()));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventSubscription, CoordinatorError> {
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pattern = topic.to_string();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok((topic, event)) => {
                        if topic_matches(&pattern, &topic) && tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "sc.coordinator.bus",
                            skipped = skipped,
                            pattern = %pattern,
                            "Subscriber lagged, events dropped until next resync"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
