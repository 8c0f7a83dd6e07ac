//! Event bus doubles.
//!
//! [`ChaoticEventBus`] delivers every event twice and swaps each pair of
//! consecutive publishes, the worst case an at-least-once, unordered
//! transport may produce. [`DownEventBus`] refuses everything.

use async_trait::async_trait;
use coordinator::bus::{EventSubscription, InMemoryEventBus, ViewerEventBus};
use coordinator::{CoordinatorError, ViewerEvent};
use std::sync::Mutex;

/// Bus that duplicates and reorders deliveries.
#[derive(Debug, Default)]
pub struct ChaoticEventBus {
    inner: InMemoryEventBus,
    held: Mutex<Option<(String, ViewerEvent)>>,
}

impl ChaoticEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn deliver_twice(&self, topic: &str, event: &ViewerEvent) {
        self.inner.publish(topic, event).await.unwrap();
        self.inner.publish(topic, event).await.unwrap();
    }

    /// Deliver an event still held back for reordering.
    pub async fn flush(&self) {
        let held = self.held.lock().unwrap().take();
        if let Some((topic, event)) = held {
            self.deliver_twice(&topic, &event).await;
        }
    }
}

#[async_trait]
impl ViewerEventBus for ChaoticEventBus {
    async fn publish(&self, topic: &str, event: &ViewerEvent) -> Result<(), CoordinatorError> {
        let previous = {
            let mut held = self.held.lock().unwrap();
            match held.take() {
                Some(previous) => Some(previous),
                None => {
                    *held = Some((topic.to_string(), event.clone()));
                    None
                }
            }
        };

        if let Some((prev_topic, prev_event)) = previous {
            // Newer first, then the one published before it
            self.deliver_twice(topic, event).await;
            self.deliver_twice(&prev_topic, &prev_event).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<EventSubscription, CoordinatorError> {
        self.inner.subscribe(topic).await
    }
}

/// Bus whose broker is unreachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownEventBus;

#[async_trait]
impl ViewerEventBus for DownEventBus {
    async fn publish(&self, _: &str, _: &ViewerEvent) -> Result<(), CoordinatorError> {
        Err(CoordinatorError::Bus("connection refused".to_string()))
    }

    async fn subscribe(&self, _: &str) -> Result<EventSubscription, CoordinatorError> {
        Err(CoordinatorError::Bus("connection refused".to_string()))
    }
}
