//! Stream lifecycle.
//!
//! A stream goes `live` once and `ended` once. The shared
//! [`LifecycleStore`] decides every transition, so all replicas agree;
//! each replica keeps a local view that only moves forward and broadcasts
//! every change of that view as a [`StreamTransition`] to local
//! subscribers such as the recording and CDN pipeline. Repeating a
//! transition is a no-op; an ended stream id cannot go live again.

use crate::errors::StreamControllerError;
use crate::lifecycle_store::{InMemoryLifecycleStore, LifecycleStore, TransitionOutcome};
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Broadcast ring size for transition subscribers.
pub const TRANSITION_BUFFER: usize = 1024;

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Live,
    Ended,
}

impl StreamState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Live => "live",
            StreamState::Ended => "ended",
        }
    }
}

/// A state change, as published to downstream pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTransition {
    pub stream_id: String,
    pub state: StreamState,
    pub at: DateTime<Utc>,
}

impl StreamTransition {
    fn now(stream_id: &str, state: StreamState) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            state,
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StreamRecord {
    state: StreamState,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

/// This replica's view of stream states, kept in step with the shared store.
pub struct StreamLifecycle {
    streams: DashMap<String, StreamRecord>,
    transitions: broadcast::Sender<StreamTransition>,
    store: Arc<dyn LifecycleStore>,
}

impl Default for StreamLifecycle {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryLifecycleStore::new()))
    }
}

impl std::fmt::Debug for StreamLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamLifecycle")
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

impl StreamLifecycle {
    #[must_use]
    pub fn new(store: Arc<dyn LifecycleStore>) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            streams: DashMap::new(),
            transitions,
            store,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn LifecycleStore> {
        &self.store
    }

    /// Receive every change of this replica's view from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamTransition> {
        self.transitions.subscribe()
    }

    /// Mark a stream live. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the stream has ended, or `LifecycleStore`.
    pub async fn start_stream(&self, stream_id: &str) -> Result<bool, StreamControllerError> {
        let transition = StreamTransition::now(stream_id, StreamState::Live);

        match self.store.transition(&transition).await? {
            TransitionOutcome::Applied => {
                self.apply(&transition);
                Ok(true)
            }
            TransitionOutcome::Unchanged => {
                debug!(
                    target: "sc.stream.lifecycle",
                    stream_id = %stream_id,
                    "Stream already live"
                );
                self.apply(&transition);
                Ok(false)
            }
            TransitionOutcome::Rejected { from } => {
                if from == Some(StreamState::Ended) {
                    self.apply(&StreamTransition::now(stream_id, StreamState::Ended));
                }
                Err(StreamControllerError::InvalidTransition {
                    stream_id: stream_id.to_string(),
                    from: from.map_or("unknown", |state| state.as_str()),
                    to: StreamState::Live.as_str(),
                })
            }
        }
    }

    /// Mark a stream ended. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the stream never went live, or
    /// `LifecycleStore`.
    pub async fn end_stream(&self, stream_id: &str) -> Result<bool, StreamControllerError> {
        let transition = StreamTransition::now(stream_id, StreamState::Ended);

        match self.store.transition(&transition).await? {
            TransitionOutcome::Applied => {
                self.apply(&transition);
                Ok(true)
            }
            TransitionOutcome::Unchanged => {
                self.apply(&transition);
                Ok(false)
            }
            TransitionOutcome::Rejected { from } => Err(StreamControllerError::InvalidTransition {
                stream_id: stream_id.to_string(),
                from: from.map_or("unknown", |state| state.as_str()),
                to: StreamState::Ended.as_str(),
            }),
        }
    }

    /// Shared state of a stream, folded into the local view on the way.
    ///
    /// # Errors
    ///
    /// `LifecycleStore` if the store cannot be read.
    pub async fn refresh(&self, stream_id: &str) -> Result<Option<StreamState>, StreamControllerError> {
        let shared = self.store.state(stream_id).await?;
        if let Some(state) = shared {
            self.apply(&StreamTransition::now(stream_id, state));
        }
        Ok(shared)
    }

    /// Fold a transition into the local view. The view only moves forward:
    /// `ended` is final and a late `live` after it is ignored. Returns
    /// whether the view changed, in which case local subscribers are told.
    pub fn apply(&self, transition: &StreamTransition) -> bool {
        let stream_id = transition.stream_id.as_str();
        let at = transition.at;

        let duration_secs = match self.streams.entry(stream_id.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(StreamRecord {
                    state: transition.state,
                    started_at: at,
                    ended_at: (transition.state == StreamState::Ended).then_some(at),
                });
                None
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.state == StreamState::Ended || transition.state == StreamState::Live {
                    return false;
                }
                record.state = StreamState::Ended;
                record.ended_at = Some(at);
                Some((at - record.started_at).num_seconds())
            }
        };

        match transition.state {
            StreamState::Live => {
                info!(target: "sc.stream.lifecycle", stream_id = %stream_id, "Stream live");
            }
            StreamState::Ended => {
                info!(
                    target: "sc.stream.lifecycle",
                    stream_id = %stream_id,
                    duration_secs = duration_secs,
                    "Stream ended"
                );
            }
        }
        self.announce(transition);
        true
    }

    fn announce(&self, transition: &StreamTransition) {
        metrics::record_stream_transition(transition.state.as_str());
        metrics::set_live_streams(self.live_streams().len());

        // No subscribers is fine; the pipeline may not be attached yet
        let _ = self.transitions.send(transition.clone());
    }

    /// Current state in this replica's view, if the stream was ever seen.
    #[must_use]
    pub fn state(&self, stream_id: &str) -> Option<StreamState> {
        self.streams.get(stream_id).map(|record| record.state)
    }

    #[must_use]
    pub fn is_live(&self, stream_id: &str) -> bool {
        self.state(stream_id) == Some(StreamState::Live)
    }

    /// When the stream ended, if it has.
    #[must_use]
    pub fn ended_at(&self, stream_id: &str) -> Option<DateTime<Utc>> {
        self.streams.get(stream_id).and_then(|record| record.ended_at)
    }

    /// Ids of every live stream, sorted.
    #[must_use]
    pub fn live_streams(&self) -> Vec<String> {
        let mut live: Vec<String> = self
            .streams
            .iter()
            .filter(|entry| entry.value().state == StreamState::Live)
            .map(|entry| entry.key().clone())
            .collect();
        live.sort();
        live
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn shared_pair() -> (StreamLifecycle, StreamLifecycle) {
        let store = Arc::new(InMemoryLifecycleStore::new());
        (
            StreamLifecycle::new(store.clone()),
            StreamLifecycle::new(store),
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_live() {
        let lifecycle = StreamLifecycle::default();

        assert!(lifecycle.start_stream("s1").await.unwrap());
        assert!(!lifecycle.start_stream("s1").await.unwrap());
        assert_eq!(lifecycle.state("s1"), Some(StreamState::Live));
        assert_eq!(lifecycle.live_streams(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_end_is_idempotent_once_ended() {
        let lifecycle = StreamLifecycle::default();
        lifecycle.start_stream("s1").await.unwrap();

        assert!(lifecycle.end_stream("s1").await.unwrap());
        assert!(!lifecycle.end_stream("s1").await.unwrap());
        assert_eq!(lifecycle.state("s1"), Some(StreamState::Ended));
        assert!(lifecycle.ended_at("s1").is_some());
        assert!(lifecycle.live_streams().is_empty());
    }

    #[tokio::test]
    async fn test_ended_stream_cannot_restart() {
        let lifecycle = StreamLifecycle::default();
        lifecycle.start_stream("s1").await.unwrap();
        lifecycle.end_stream("s1").await.unwrap();

        let err = lifecycle.start_stream("s1").await.unwrap_err();
        assert!(matches!(
            err,
            StreamControllerError::InvalidTransition {
                from: "ended",
                to: "live",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ending_unknown_stream_is_invalid() {
        let lifecycle = StreamLifecycle::default();
        let err = lifecycle.end_stream("never-started").await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_transition");
        assert!(!lifecycle.is_live("never-started"));
    }

    #[tokio::test]
    async fn test_subscribers_see_each_real_transition_once() {
        let lifecycle = StreamLifecycle::default();
        let mut rx = lifecycle.subscribe();

        lifecycle.start_stream("s1").await.unwrap();
        lifecycle.start_stream("s1").await.unwrap();
        lifecycle.end_stream("s1").await.unwrap();
        lifecycle.end_stream("s1").await.unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.stream_id, "s1");
        assert_eq!(first.state, StreamState::Live);

        let second = rx.try_recv().unwrap();
        assert_eq!(second.state, StreamState::Ended);
        assert!(second.at >= first.at);

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_replica_cannot_restart_stream_ended_elsewhere() {
        let (east, west) = shared_pair();

        assert!(east.start_stream("s1").await.unwrap());
        assert!(!west.start_stream("s1").await.unwrap(), "already live in the store");
        assert!(west.is_live("s1"));

        assert!(east.end_stream("s1").await.unwrap());
        let err = west.start_stream("s1").await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_transition");
        assert_eq!(west.state("s1"), Some(StreamState::Ended));
    }

    #[tokio::test]
    async fn test_refresh_folds_shared_state_into_view() {
        let (east, west) = shared_pair();
        let mut west_pipeline = west.subscribe();

        east.start_stream("s1").await.unwrap();
        assert_eq!(west.state("s1"), None);

        assert_eq!(west.refresh("s1").await.unwrap(), Some(StreamState::Live));
        assert!(west.is_live("s1"));
        assert_eq!(west_pipeline.try_recv().unwrap().state, StreamState::Live);

        assert_eq!(west.refresh("s2").await.unwrap(), None);
        assert_eq!(west.state("s2"), None);
    }

    #[test]
    fn test_apply_only_moves_forward() {
        let lifecycle = StreamLifecycle::default();
        let ended = StreamTransition::now("s1", StreamState::Ended);
        let late_live = StreamTransition::now("s1", StreamState::Live);

        assert!(lifecycle.apply(&ended));
        assert!(!lifecycle.apply(&late_live));
        assert!(!lifecycle.apply(&ended));
        assert_eq!(lifecycle.state("s1"), Some(StreamState::Ended));
    }

    #[test]
    fn test_transition_wire_format() {
        let transition = StreamTransition {
            stream_id: "s1".to_string(),
            state: StreamState::Ended,
            at: Utc::now(),
        };

        let json = serde_json::to_value(&transition).unwrap();
        assert_eq!(json["state"], "ended");
        assert_eq!(json["stream_id"], "s1");
    }
}
