//! Layer switch dispatch to the media transport.

use crate::errors::QualityError;
use crate::layers::QualityLayer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

/// Instruction for the transport to forward a different layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSwitch {
    pub stream_id: String,
    pub viewer_id: String,
    pub layer: QualityLayer,
    pub issued_at: DateTime<Utc>,
}

/// Delivers layer switches to whatever forwards media to the viewer.
#[async_trait]
pub trait LayerSwitchDispatcher: Send + Sync {
    async fn dispatch(&self, switch: &LayerSwitch) -> Result<(), QualityError>;
}

/// Forwards switches over an mpsc channel to a transport adapter task.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: mpsc::Sender<LayerSwitch>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiver the adapter drains.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<LayerSwitch>) {
        let (sender, receiver) = mpsc::channel(buffer);
        (Self { sender }, receiver)
    }

    #[must_use]
    pub fn new(sender: mpsc::Sender<LayerSwitch>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl LayerSwitchDispatcher for ChannelDispatcher {
    async fn dispatch(&self, switch: &LayerSwitch) -> Result<(), QualityError> {
        self.sender.try_send(switch.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                QualityError::Dispatch("transport queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                QualityError::Dispatch("transport adapter closed".to_string())
            }
        })
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based count of failures so far).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn switch(layer: QualityLayer) -> LayerSwitch {
        LayerSwitch {
            stream_id: "stream-1".to_string(),
            viewer_id: "viewer-1".to_string(),
            layer,
            issued_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_dispatcher_forwards() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel(4);
        dispatcher.dispatch(&switch(QualityLayer::P720)).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.layer, QualityLayer::P720);
        assert_eq!(received.viewer_id, "viewer-1");
    }

    #[tokio::test]
    async fn test_channel_dispatcher_full_is_error() {
        let (dispatcher, _rx) = ChannelDispatcher::channel(1);
        dispatcher.dispatch(&switch(QualityLayer::P720)).await.unwrap();

        let err = dispatcher
            .dispatch(&switch(QualityLayer::P1080))
            .await
            .unwrap_err();
        assert_eq!(err, QualityError::Dispatch("transport queue full".to_string()));
    }

    #[tokio::test]
    async fn test_channel_dispatcher_closed_is_error() {
        let (dispatcher, rx) = ChannelDispatcher::channel(1);
        drop(rx);

        let err = dispatcher
            .dispatch(&switch(QualityLayer::P360))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "dispatch_failed");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_secs(1));
    }

    #[test]
    fn test_layer_switch_serializes_layer_label() {
        let json = serde_json::to_value(switch(QualityLayer::P1080)).unwrap();
        assert_eq!(json["layer"], "1080p");
    }
}
