//! Viewer join/leave events carried on the pub/sub bus.
//!
//! # Topics
//!
//! - `viewers.{stream_id}` - one topic per stream
//! - `viewers.*` - pattern a replica subscribes to for all streams

use serde::{Deserialize, Serialize};

/// Topic prefix for viewer events.
pub const TOPIC_PREFIX: &str = "viewers.";

/// Subscription pattern matching every stream's topic.
pub const ALL_STREAMS_PATTERN: &str = "viewers.*";

/// Join or leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerAction {
    Join,
    Leave,
}

impl ViewerAction {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewerAction::Join => "join",
            ViewerAction::Leave => "leave",
        }
    }
}

/// A viewer joined or left a stream on a given SFU.
///
/// `occurred_at_ms` (Unix millis at the publishing replica) orders events for
/// the same viewer so reordered deliveries resolve last-writer-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerEvent {
    pub stream_id: String,
    pub viewer_id: String,
    pub server_id: String,
    pub action: ViewerAction,
    pub occurred_at_ms: i64,
}

impl ViewerEvent {
    /// Join event stamped with the current wall-clock time.
    #[must_use]
    pub fn join(stream_id: &str, viewer_id: &str, server_id: &str) -> Self {
        Self::now(stream_id, viewer_id, server_id, ViewerAction::Join)
    }

    /// Leave event stamped with the current wall-clock time.
    #[must_use]
    pub fn leave(stream_id: &str, viewer_id: &str, server_id: &str) -> Self {
        Self::now(stream_id, viewer_id, server_id, ViewerAction::Leave)
    }

    fn now(stream_id: &str, viewer_id: &str, server_id: &str, action: ViewerAction) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            viewer_id: viewer_id.to_string(),
            server_id: server_id.to_string(),
            action,
            occurred_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Topic this event is published on.
    #[must_use]
    pub fn topic(&self) -> String {
        topic_for_stream(&self.stream_id)
    }
}

/// Topic for a stream's viewer events.
#[must_use]
pub fn topic_for_stream(stream_id: &str) -> String {
    format!("{TOPIC_PREFIX}{stream_id}")
}

/// Whether `topic` matches a subscription `pattern`.
///
/// Only a trailing `*` wildcard is supported, which is all the coordinator
/// subscribes with.
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}
