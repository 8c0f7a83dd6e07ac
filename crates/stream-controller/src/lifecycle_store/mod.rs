//! Stream lifecycle state shared by every replica.
//!
//! The store is the authority for whether a stream is live or ended: a
//! transition is checked and applied atomically there, so two replicas
//! racing to end the same stream see exactly one `Applied`. Applied
//! transitions are published to every subscribed replica, which folds them
//! into its local [`crate::lifecycle::StreamLifecycle`] view.

mod memory;
mod redis_store;

pub use self::memory::InMemoryLifecycleStore;
pub use self::redis_store::{RedisLifecycleStore, ENDED_STREAM_RETENTION, LIFECYCLE_CHANNEL};

use crate::errors::StreamControllerError;
use crate::lifecycle::{StreamState, StreamTransition};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Buffer between a store's receive loop and the subscriber.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Applied transitions delivered to one subscriber.
pub type TransitionSubscription = mpsc::Receiver<StreamTransition>;

/// Result of asking the store for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// This call moved the stream; subscribers are notified.
    Applied,
    /// The stream was already in the target state.
    Unchanged,
    /// The current state does not allow the move. `None` means the stream
    /// was never started.
    Rejected { from: Option<StreamState> },
}

#[async_trait]
pub trait LifecycleStore: Send + Sync {
    /// Atomically apply `transition` if the stream's shared state allows it.
    async fn transition(
        &self,
        transition: &StreamTransition,
    ) -> Result<TransitionOutcome, StreamControllerError>;

    /// Shared state of a stream, `None` if it never went live.
    async fn state(&self, stream_id: &str) -> Result<Option<StreamState>, StreamControllerError>;

    /// Receive every applied transition from now on.
    ///
    /// The subscription ends when the receiver is dropped.
    async fn subscribe(&self) -> Result<TransitionSubscription, StreamControllerError>;
}

/// Shared transition rule: `live` once from nothing, `ended` once from
/// `live`.
#[must_use]
pub fn decide(current: Option<StreamState>, target: StreamState) -> TransitionOutcome {
    match (current, target) {
        (Some(current), target) if current == target => TransitionOutcome::Unchanged,
        (None, StreamState::Live) | (Some(StreamState::Live), StreamState::Ended) => {
            TransitionOutcome::Applied
        }
        (from, _) => TransitionOutcome::Rejected { from },
    }
}
