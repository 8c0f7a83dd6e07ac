//! Stream Controller error types.
//!
//! Component errors are wrapped unchanged so callers can still match on
//! `WriteOverload` or `NoAvailableServer`.

use crate::config::ConfigError;
use chat_store::ChatStoreError;
use coordinator::CoordinatorError;
use quality_controller::QualityError;
use thiserror::Error;

/// Stream Controller error type.
#[derive(Debug, Error)]
pub enum StreamControllerError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Quality(#[from] QualityError),

    #[error(transparent)]
    Chat(#[from] ChatStoreError),

    /// A lifecycle change the stream's current state does not allow.
    #[error("Invalid transition for stream {stream_id}: {from} -> {to}")]
    InvalidTransition {
        stream_id: String,
        from: &'static str,
        to: &'static str,
    },

    /// Viewers can only join a live stream.
    #[error("Stream is not live: {0}")]
    StreamNotLive(String),

    /// No active session for this viewer on this stream.
    #[error("Viewer session not found: {viewer_id} on {stream_id}")]
    SessionNotFound {
        stream_id: String,
        viewer_id: String,
    },

    /// The shared lifecycle store could not be reached or answered badly.
    #[error("Lifecycle store error: {0}")]
    LifecycleStore(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl StreamControllerError {
    /// Stable code used for metric labels and API responses.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            StreamControllerError::Coordinator(e) => e.error_code(),
            StreamControllerError::Quality(e) => e.error_code(),
            StreamControllerError::Chat(e) => e.error_code(),
            StreamControllerError::InvalidTransition { .. } => "invalid_transition",
            StreamControllerError::StreamNotLive(_) => "stream_not_live",
            StreamControllerError::SessionNotFound { .. } => "session_not_found",
            StreamControllerError::LifecycleStore(_) => "lifecycle_store_error",
            StreamControllerError::Config(_) => "config_error",
        }
    }

    /// Client-safe message with backend details removed.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            StreamControllerError::Coordinator(CoordinatorError::NoAvailableServer) => {
                "No media server is available, please try again".to_string()
            }
            StreamControllerError::Chat(ChatStoreError::WriteOverload) => {
                "Chat is busy, please try again".to_string()
            }
            StreamControllerError::Chat(ChatStoreError::InvalidMessage(reason)) => reason.clone(),
            StreamControllerError::InvalidTransition { .. }
            | StreamControllerError::StreamNotLive(_)
            | StreamControllerError::SessionNotFound { .. } => self.to_string(),
            StreamControllerError::Coordinator(CoordinatorError::Timeout)
            | StreamControllerError::Chat(ChatStoreError::Timeout | ChatStoreError::ReadTimeout) => {
                "The request timed out".to_string()
            }
            _ => "An internal error occurred".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_component_error_codes_pass_through() {
        let err: StreamControllerError = CoordinatorError::NoAvailableServer.into();
        assert_eq!(err.error_code(), "no_available_server");

        let err: StreamControllerError = ChatStoreError::WriteOverload.into();
        assert_eq!(err.error_code(), "write_overload");

        let err: StreamControllerError = QualityError::LoopClosed.into();
        assert_eq!(err.error_code(), "loop_closed");
    }

    #[test]
    fn test_service_error_codes() {
        let err = StreamControllerError::InvalidTransition {
            stream_id: "s1".to_string(),
            from: "ended",
            to: "live",
        };
        assert_eq!(err.error_code(), "invalid_transition");
        assert_eq!(
            err.to_string(),
            "Invalid transition for stream s1: ended -> live"
        );

        let err = StreamControllerError::SessionNotFound {
            stream_id: "s1".to_string(),
            viewer_id: "v1".to_string(),
        };
        assert_eq!(err.error_code(), "session_not_found");

        let err = StreamControllerError::LifecycleStore("connection reset".to_string());
        assert_eq!(err.error_code(), "lifecycle_store_error");
        assert_eq!(err.client_message(), "An internal error occurred");
    }

    #[test]
    fn test_client_message_hides_backend_details() {
        let err: StreamControllerError =
            ChatStoreError::Database("relation chat_messages does not exist".to_string()).into();
        assert_eq!(err.client_message(), "An internal error occurred");

        let err: StreamControllerError =
            CoordinatorError::Redis("connection refused 10.0.0.3".to_string()).into();
        assert!(!err.client_message().contains("10.0.0.3"));

        let err: StreamControllerError =
            ChatStoreError::InvalidMessage("message text must not be empty".to_string()).into();
        assert_eq!(err.client_message(), "message text must not be empty");
    }
}
