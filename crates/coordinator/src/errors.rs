//! Coordinator error types.

use common::deadline::DeadlineExceeded;
use thiserror::Error;

/// Coordinator error type.
///
/// Duplicate or stale viewer events are not errors; they are deduplicated
/// by the membership sets and only show up in metrics.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Every registered instance is unhealthy or at capacity.
    #[error("No SFU instance available")]
    NoAvailableServer,

    /// The caller's deadline passed.
    #[error("Operation timed out")]
    Timeout,

    /// Registration with a capacity that can never accept a viewer.
    #[error("Invalid capacity for {server_id}: {capacity}")]
    InvalidCapacity { server_id: String, capacity: u32 },

    /// Heartbeat or lookup for an instance that never registered.
    #[error("Unknown SFU instance: {0}")]
    UnknownServer(String),

    /// Event bus publish/subscribe failed.
    #[error("Event bus error: {0}")]
    Bus(String),

    /// Redis operation failed.
    #[error("Redis error: {0}")]
    Redis(String),

    /// Event payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoordinatorError {
    /// Stable code used for metric labels and API responses.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinatorError::NoAvailableServer => "no_available_server",
            CoordinatorError::Timeout => "timeout",
            CoordinatorError::InvalidCapacity { .. } => "invalid_capacity",
            CoordinatorError::UnknownServer(_) => "unknown_server",
            CoordinatorError::Bus(_) => "bus_error",
            CoordinatorError::Redis(_) => "redis_error",
            CoordinatorError::Serialization(_) => "serialization_error",
        }
    }

    /// Whether a caller may reasonably retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::NoAvailableServer
                | CoordinatorError::Timeout
                | CoordinatorError::Bus(_)
                | CoordinatorError::Redis(_)
        )
    }
}

impl From<DeadlineExceeded> for CoordinatorError {
    fn from(_: DeadlineExceeded) -> Self {
        CoordinatorError::Timeout
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(e: serde_json::Error) -> Self {
        CoordinatorError::Serialization(e.to_string())
    }
}
