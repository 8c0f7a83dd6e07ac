//! Stream controller facade.
//!
//! The library surface a thin control API would call: start and stop
//! streams, connect viewers, post and page chat, read viewer counts. All
//! collaborators are constructed once by the process and passed in by
//! handle.

use crate::errors::StreamControllerError;
use crate::lifecycle::{StreamLifecycle, StreamState, StreamTransition};
use crate::lifecycle_store::{LifecycleStore, TransitionSubscription};
use crate::sessions::{ViewerSession, ViewerSessionService, ViewerSessionStatus};
use chat_store::{ChatCursor, ChatMessage, ChatPage, ChatStore, NewChatMessage};
use chrono::{DateTime, Utc};
use common::deadline::Deadline;
use coordinator::Coordinator;
use quality_controller::TransportStats;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, instrument};

/// Default chat write deadline.
pub const DEFAULT_CHAT_WRITE_TIMEOUT: Duration = Duration::from_millis(50);

/// Default chat read deadline.
pub const DEFAULT_CHAT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Deadline for the on-demand viewer recount.
pub const VIEWER_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Chat deadlines applied when the caller has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTimeouts {
    pub write: Duration,
    pub read: Duration,
}

impl Default for ChatTimeouts {
    fn default() -> Self {
        Self {
            write: DEFAULT_CHAT_WRITE_TIMEOUT,
            read: DEFAULT_CHAT_READ_TIMEOUT,
        }
    }
}

/// Control plane for one replica.
pub struct StreamController {
    coordinator: Arc<Coordinator>,
    sessions: ViewerSessionService,
    lifecycle: StreamLifecycle,
    chat: Arc<dyn ChatStore>,
    chat_timeouts: ChatTimeouts,
}

impl StreamController {
    #[must_use]
    pub fn new(
        coordinator: Arc<Coordinator>,
        sessions: ViewerSessionService,
        chat: Arc<dyn ChatStore>,
        chat_timeouts: ChatTimeouts,
    ) -> Self {
        Self {
            coordinator,
            sessions,
            lifecycle: StreamLifecycle::default(),
            chat,
            chat_timeouts,
        }
    }

    /// Share lifecycle state with other replicas through `store`.
    #[must_use]
    pub fn with_lifecycle_store(mut self, store: Arc<dyn LifecycleStore>) -> Self {
        self.lifecycle = StreamLifecycle::new(store);
        self
    }

    #[must_use]
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    #[must_use]
    pub fn sessions(&self) -> &ViewerSessionService {
        &self.sessions
    }

    #[must_use]
    pub fn chat_store(&self) -> &Arc<dyn ChatStore> {
        &self.chat
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Take a stream live. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the stream already ended, or
    /// `LifecycleStore`.
    pub async fn start_stream(&self, stream_id: &str) -> Result<bool, StreamControllerError> {
        self.lifecycle.start_stream(stream_id).await
    }

    /// End a stream and disconnect its viewers on this replica. Returns
    /// `false` if it had already ended. Other replicas release theirs when
    /// the transition reaches them.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the stream never went live, or
    /// `LifecycleStore`.
    #[instrument(skip_all, name = "sc.stream.stop", fields(stream_id = %stream_id))]
    pub async fn stop_stream(&self, stream_id: &str) -> Result<bool, StreamControllerError> {
        let transitioned = self.lifecycle.end_stream(stream_id).await?;
        self.release_viewers(stream_id).await;
        Ok(transitioned)
    }

    /// Fold a transition applied by any replica into this one, releasing
    /// local viewers when the stream ended. Returns whether the local view
    /// changed.
    pub async fn apply_transition(&self, transition: &StreamTransition) -> bool {
        let changed = self.lifecycle.apply(transition);
        if transition.state == StreamState::Ended {
            self.release_viewers(&transition.stream_id).await;
        }
        changed
    }

    async fn release_viewers(&self, stream_id: &str) {
        let disconnected = self.sessions.disconnect_stream(stream_id).await;
        if disconnected > 0 {
            info!(
                target: "sc.stream.lifecycle",
                stream_id = %stream_id,
                disconnected = disconnected,
                "Viewers released from ended stream"
            );
        }
    }

    /// Applied transitions from every replica, for
    /// [`crate::tasks::start_lifecycle_consumer`].
    ///
    /// # Errors
    ///
    /// `LifecycleStore` if the subscription cannot be opened.
    pub async fn subscribe_shared_transitions(
        &self,
    ) -> Result<TransitionSubscription, StreamControllerError> {
        self.lifecycle.store().subscribe().await
    }

    #[must_use]
    pub fn stream_state(&self, stream_id: &str) -> Option<StreamState> {
        self.lifecycle.state(stream_id)
    }

    #[must_use]
    pub fn live_streams(&self) -> Vec<String> {
        self.lifecycle.live_streams()
    }

    /// Lifecycle transitions for the recording and CDN pipeline attached to
    /// this replica.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StreamTransition> {
        self.lifecycle.subscribe()
    }

    // ------------------------------------------------------------------
    // Viewers
    // ------------------------------------------------------------------

    /// Connect a viewer to a live stream.
    ///
    /// Liveness is read from the shared store, so a stream started or ended
    /// on another replica is honored even before its transition arrives.
    ///
    /// # Errors
    ///
    /// `StreamNotLive`, `LifecycleStore`, or selection errors from the
    /// coordinator.
    pub async fn connect_viewer(
        &self,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<ViewerSession, StreamControllerError> {
        match self.lifecycle.refresh(stream_id).await? {
            Some(StreamState::Live) => self.sessions.connect(stream_id, viewer_id).await,
            Some(StreamState::Ended) => {
                self.release_viewers(stream_id).await;
                Err(StreamControllerError::StreamNotLive(stream_id.to_string()))
            }
            None => Err(StreamControllerError::StreamNotLive(stream_id.to_string())),
        }
    }

    /// # Errors
    ///
    /// `SessionNotFound` if the viewer is not connected.
    pub async fn disconnect_viewer(
        &self,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<ViewerSession, StreamControllerError> {
        self.sessions.disconnect(stream_id, viewer_id).await
    }

    /// Feed a transport stats report to the viewer's quality loop.
    ///
    /// # Errors
    ///
    /// `SessionNotFound`, or `Quality(MailboxFull)` when the report was
    /// dropped.
    pub fn report_stats(
        &self,
        stream_id: &str,
        viewer_id: &str,
        stats: TransportStats,
    ) -> Result<(), StreamControllerError> {
        self.sessions.report_stats(stream_id, viewer_id, stats)
    }

    /// # Errors
    ///
    /// `SessionNotFound` if the viewer is not connected.
    pub async fn viewer_status(
        &self,
        stream_id: &str,
        viewer_id: &str,
    ) -> Result<ViewerSessionStatus, StreamControllerError> {
        self.sessions.status(stream_id, viewer_id).await
    }

    /// Cached viewer count across all replicas, as last synchronized.
    #[must_use]
    pub fn viewer_count(&self, stream_id: &str) -> usize {
        self.coordinator.viewer_count(stream_id)
    }

    /// Recount a stream's viewers from the membership ledger.
    ///
    /// # Errors
    ///
    /// Ledger failures or `Timeout`.
    pub async fn sync_viewer_count(&self, stream_id: &str) -> Result<usize, StreamControllerError> {
        Ok(self
            .coordinator
            .sync_viewer_count(stream_id, Deadline::after(VIEWER_SYNC_TIMEOUT))
            .await?)
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    /// Store a chat message under the default write deadline.
    ///
    /// # Errors
    ///
    /// Chat store errors, including `WriteOverload` under load.
    pub async fn post_chat(
        &self,
        message: NewChatMessage,
    ) -> Result<ChatMessage, StreamControllerError> {
        Ok(self
            .chat
            .create(message, Deadline::after(self.chat_timeouts.write))
            .await?)
    }

    /// Newest-first chat history, older than `before` when given.
    ///
    /// # Errors
    ///
    /// Chat store errors, including `ReadTimeout`.
    pub async fn chat_history(
        &self,
        stream_id: &str,
        limit: usize,
        before: Option<ChatCursor>,
    ) -> Result<ChatPage, StreamControllerError> {
        Ok(self
            .chat
            .list_by_stream(stream_id, limit, before, Deadline::after(self.chat_timeouts.read))
            .await?)
    }

    /// Chat messages with `from <= created_at < to`, newest first.
    ///
    /// # Errors
    ///
    /// Chat store errors, including `ReadTimeout`.
    pub async fn chat_range(
        &self,
        stream_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StreamControllerError> {
        Ok(self
            .chat
            .list_range(stream_id, from, to, limit, Deadline::after(self.chat_timeouts.read))
            .await?)
    }

    /// Stop every viewer quality loop.
    pub fn shutdown(&self) {
        self.sessions.shutdown();
    }
}

impl std::fmt::Debug for StreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamController")
            .field("replica_id", &self.coordinator.replica_id())
            .field("sessions", &self.sessions.len())
            .field("live_streams", &self.lifecycle.live_streams().len())
            .finish_non_exhaustive()
    }
}
