//! Caller-supplied deadlines.
//!
//! Every operation that can block on I/O (SFU selection, event publish,
//! chat store round-trips) takes a [`Deadline`]. Components never retry on
//! their own; when the deadline passes they return a timeout error and the
//! caller decides on backoff.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// The deadline passed before the operation completed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// An absolute point in time by which an operation must finish.
///
/// Built on `tokio::time::Instant` so paused-clock tests can drive it with
/// `tokio::time::advance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    /// Deadline at an absolute instant.
    #[must_use]
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// The instant this deadline expires.
    #[must_use]
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Time left before expiry, zero once expired.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has already passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Run `fut` to completion unless the deadline passes first.
    ///
    /// An already-expired deadline fails without polling `fut`, so work that
    /// would complete synchronously still honors the caller's budget.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineExceeded`] if the deadline is reached first.
    pub async fn run<F>(self, fut: F) -> Result<F::Output, DeadlineExceeded>
    where
        F: Future,
    {
        if self.is_expired() {
            return Err(DeadlineExceeded);
        }
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| DeadlineExceeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_before_deadline() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let result = deadline.run(async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let result = deadline
            .run(tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert_eq!(result, Err(DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_does_not_poll_future() {
        let deadline = Deadline::after(Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(20)).await;

        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
        let result = deadline.run(async { 1 }).await;
        assert_eq!(result, Err(DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_shrinks_with_time() {
        let deadline = Deadline::after(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(deadline.remaining(), Duration::from_secs(3));
    }
}
