//! Quality controller error types.
//!
//! Blocked-by-hysteresis and first-sample initialization are normal
//! decision outcomes, not errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QualityError {
    /// The media transport rejected or failed a layer switch.
    #[error("Layer switch dispatch failed: {0}")]
    Dispatch(String),

    /// The viewer loop's mailbox is full; the report was dropped.
    #[error("Viewer loop mailbox full")]
    MailboxFull,

    /// The viewer loop has stopped.
    #[error("Viewer loop closed")]
    LoopClosed,
}

impl QualityError {
    /// Stable code used for metric labels.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            QualityError::Dispatch(_) => "dispatch_failed",
            QualityError::MailboxFull => "mailbox_full",
            QualityError::LoopClosed => "loop_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            QualityError::Dispatch("x".to_string()).error_code(),
            "dispatch_failed"
        );
        assert_eq!(QualityError::MailboxFull.error_code(), "mailbox_full");
        assert_eq!(QualityError::LoopClosed.error_code(), "loop_closed");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            QualityError::Dispatch("sfu unreachable".to_string()).to_string(),
            "Layer switch dispatch failed: sfu unreachable"
        );
    }
}
