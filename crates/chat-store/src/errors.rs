//! Chat store error types.

use common::deadline::DeadlineExceeded;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatStoreError {
    /// No write permit was immediately available.
    #[error("Chat store is overloaded")]
    WriteOverload,

    /// Write deadline elapsed.
    #[error("Chat write timed out")]
    Timeout,

    /// Read deadline elapsed.
    #[error("Chat read timed out")]
    ReadTimeout,

    /// A different message already exists under the same key.
    #[error("Conflicting message for key: {0}")]
    Conflict(String),

    /// Message rejected by validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatStoreError {
    /// Stable code used for metric labels.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            ChatStoreError::WriteOverload => "write_overload",
            ChatStoreError::Timeout => "timeout",
            ChatStoreError::ReadTimeout => "read_timeout",
            ChatStoreError::Conflict(_) => "conflict",
            ChatStoreError::InvalidMessage(_) => "invalid_message",
            ChatStoreError::Database(_) => "database_error",
            ChatStoreError::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller may retry (after backing off).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatStoreError::WriteOverload
                | ChatStoreError::Timeout
                | ChatStoreError::ReadTimeout
                | ChatStoreError::Database(_)
        )
    }

    /// Map an elapsed write deadline.
    #[must_use]
    pub fn write_timeout(_: DeadlineExceeded) -> Self {
        ChatStoreError::Timeout
    }

    /// Map an elapsed read deadline.
    #[must_use]
    pub fn read_timeout(_: DeadlineExceeded) -> Self {
        ChatStoreError::ReadTimeout
    }
}

impl From<sqlx::Error> for ChatStoreError {
    fn from(err: sqlx::Error) -> Self {
        ChatStoreError::Database(err.to_string())
    }
}
