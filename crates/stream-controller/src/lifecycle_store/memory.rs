//! In-process lifecycle store.
//!
//! Clones share state, so replicas built in one process (tests, or a
//! single-replica deployment) agree on every stream.

use super::{decide, LifecycleStore, TransitionOutcome, TransitionSubscription, SUBSCRIPTION_BUFFER};
use crate::errors::StreamControllerError;
use crate::lifecycle::{StreamState, StreamTransition, TRANSITION_BUFFER};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// In-process [`LifecycleStore`].
#[derive(Debug, Clone)]
pub struct InMemoryLifecycleStore {
    states: Arc<DashMap<String, StreamState>>,
    applied: broadcast::Sender<StreamTransition>,
}

impl Default for InMemoryLifecycleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLifecycleStore {
    #[must_use]
    pub fn new() -> Self {
        let (applied, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            states: Arc::new(DashMap::new()),
            applied,
        }
    }
}

#[async_trait]
impl LifecycleStore for InMemoryLifecycleStore {
    async fn transition(
        &self,
        transition: &StreamTransition,
    ) -> Result<TransitionOutcome, StreamControllerError> {
        // Notify under the entry lock so subscribers see one stream's
        // transitions in the order they were applied
        let outcome = match self.states.entry(transition.stream_id.clone()) {
            Entry::Vacant(vacant) => {
                let outcome = decide(None, transition.state);
                if outcome == TransitionOutcome::Applied {
                    vacant.insert(transition.state);
                    let _ = self.applied.send(transition.clone());
                }
                outcome
            }
            Entry::Occupied(mut occupied) => {
                let outcome = decide(Some(*occupied.get()), transition.state);
                if outcome == TransitionOutcome::Applied {
                    occupied.insert(transition.state);
                    let _ = self.applied.send(transition.clone());
                }
                outcome
            }
        };
        Ok(outcome)
    }

    async fn state(&self, stream_id: &str) -> Result<Option<StreamState>, StreamControllerError> {
        Ok(self.states.get(stream_id).map(|state| *state))
    }

    async fn subscribe(&self) -> Result<TransitionSubscription, StreamControllerError> {
        let mut receiver = self.applied.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(transition) => {
                        if tx.send(transition).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "sc.stream.lifecycle",
                            skipped = skipped,
                            "Lifecycle subscriber lagged, transitions dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn transition(stream_id: &str, state: StreamState) -> StreamTransition {
        StreamTransition {
            stream_id: stream_id.to_string(),
            state,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_clones_share_state_and_notifications() {
        let store = InMemoryLifecycleStore::new();
        let other_replica = store.clone();
        let mut subscription = other_replica.subscribe().await.unwrap();

        assert_eq!(
            store.transition(&transition("s1", StreamState::Live)).await.unwrap(),
            TransitionOutcome::Applied
        );
        assert_eq!(
            other_replica.state("s1").await.unwrap(),
            Some(StreamState::Live)
        );
        assert_eq!(subscription.recv().await.unwrap().state, StreamState::Live);
    }

    #[tokio::test]
    async fn test_only_one_racing_end_applies() {
        let store = InMemoryLifecycleStore::new();
        store
            .transition(&transition("s1", StreamState::Live))
            .await
            .unwrap();

        let ends = futures::future::join_all((0..8).map(|_| {
            let store = store.clone();
            async move {
                store
                    .transition(&transition("s1", StreamState::Ended))
                    .await
                    .unwrap()
            }
        }))
        .await;

        let applied = ends
            .iter()
            .filter(|outcome| **outcome == TransitionOutcome::Applied)
            .count();
        assert_eq!(applied, 1);
        assert!(ends
            .iter()
            .all(|o| matches!(o, TransitionOutcome::Applied | TransitionOutcome::Unchanged)));
    }

    #[tokio::test]
    async fn test_rejected_moves_are_not_published() {
        let store = InMemoryLifecycleStore::new();
        let mut subscription = store.subscribe().await.unwrap();

        assert_eq!(
            store.transition(&transition("s1", StreamState::Ended)).await.unwrap(),
            TransitionOutcome::Rejected { from: None }
        );
        assert_eq!(store.state("s1").await.unwrap(), None);
        assert!(subscription.try_recv().is_err());
    }
}
