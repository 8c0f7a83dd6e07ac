//! Redis pub/sub event bus.
//!
//! Events are JSON on `viewers.{stream_id}` channels. Publishing uses a
//! cloned `MultiplexedConnection`; each subscription opens its own pub/sub
//! connection and forwards decoded events from a spawned task.

use super::{EventSubscription, ViewerEventBus, SUBSCRIPTION_BUFFER};
use crate::errors::CoordinatorError;
use crate::events::ViewerEvent;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

/// Redis-backed [`ViewerEventBus`].
#[derive(Clone)]
pub struct RedisEventBus {
    client: Client,
    connection: MultiplexedConnection,
}

impl RedisEventBus {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Redis` if the client cannot connect.
    pub async fn connect(redis_url: &str) -> Result<Self, CoordinatorError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log redis_url, it may carry credentials
            error!(
                target: "sc.coordinator.bus",
                error = %e,
                "Failed to open Redis client"
            );
            CoordinatorError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "sc.coordinator.bus",
                    error = %e,
                    "Failed to connect to Redis"
                );
                CoordinatorError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { client, connection })
    }
}

#[async_trait]
impl ViewerEventBus for RedisEventBus {
    #[instrument(skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, event: &ViewerEvent) -> Result<(), CoordinatorError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.connection.clone();

        let receivers: i64 = conn.publish(topic, payload).await.map_err(|e| {
            warn!(
                target: "sc.coordinator.bus",
                error = %e,
                topic = %topic,
                "Failed to publish viewer event"
            );
            CoordinatorError::Bus(format!("Failed to publish: {e}"))
        })?;

        debug!(
            target: "sc.coordinator.bus",
            topic = %topic,
            receivers = receivers,
            "Published viewer event"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(topic = %topic))]
    async fn subscribe(&self, topic: &str) -> Result<EventSubscription, CoordinatorError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| {
            CoordinatorError::Redis(format!("Failed to open pub/sub connection: {e}"))
        })?;

        let subscribed = if topic.ends_with('*') {
            pubsub.psubscribe(topic).await
        } else {
            pubsub.subscribe(topic).await
        };
        subscribed.map_err(|e| CoordinatorError::Bus(format!("Failed to subscribe: {e}")))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let pattern = topic.to_string();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(
                            target: "sc.coordinator.bus",
                            error = %e,
                            "Dropping non-text pub/sub payload"
                        );
                        continue;
                    }
                };

                match serde_json::from_str::<ViewerEvent>(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            target: "sc.coordinator.bus",
                            error = %e,
                            channel = %msg.get_channel_name(),
                            "Dropping malformed viewer event"
                        );
                    }
                }
            }
            debug!(
                target: "sc.coordinator.bus",
                pattern = %pattern,
                "Redis subscription closed"
            );
        });

        Ok(rx)
    }
}
