//! Pub/sub transport for viewer events.
//!
//! The bus is at-least-once and unordered across streams: consumers must
//! tolerate duplicates and reordering, which [`crate::membership`] does.

mod memory;
mod redis_bus;

pub use self::memory::InMemoryEventBus;
pub use self::redis_bus::RedisEventBus;

use crate::errors::CoordinatorError;
use crate::events::ViewerEvent;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Buffer between a transport's receive loop and the subscriber.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// Events delivered to one subscriber.
pub type EventSubscription = mpsc::Receiver<ViewerEvent>;

/// Publish/subscribe over viewer event topics.
#[async_trait]
pub trait ViewerEventBus: Send + Sync {
    /// Publish an event on `topic`.
    async fn publish(&self, topic: &str, event: &ViewerEvent) -> Result<(), CoordinatorError>;

    /// Subscribe to `topic`; a trailing `*` subscribes to a prefix.
    ///
    /// The subscription ends when the receiver is dropped.
    async fn subscribe(&self, topic: &str) -> Result<EventSubscription, CoordinatorError>;
}
