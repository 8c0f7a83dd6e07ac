//! Storage interface shared by the chat backends.

use crate::errors::ChatStoreError;
use crate::models::{ChatCursor, ChatMessage, ChatPage, NewChatMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::deadline::Deadline;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default number of concurrent writes admitted.
pub const DEFAULT_MAX_INFLIGHT_WRITES: usize = 4096;

/// Partitioned, TTL-bound chat history.
///
/// Implementations never retry internally; a missed deadline surfaces as
/// `Timeout` (writes) or `ReadTimeout` (reads).
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Append a message to its stream's partition.
    ///
    /// Re-writing an identical message is a no-op that returns the stored
    /// copy.
    async fn create(
        &self,
        message: NewChatMessage,
        deadline: Deadline,
    ) -> Result<ChatMessage, ChatStoreError>;

    /// Up to `limit` (capped) messages older than `since`, newest first.
    async fn list_by_stream(
        &self,
        stream_id: &str,
        limit: usize,
        since: Option<ChatCursor>,
        deadline: Deadline,
    ) -> Result<ChatPage, ChatStoreError>;

    /// Messages with `from <= created_at < to`, newest first.
    async fn list_range(
        &self,
        stream_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        deadline: Deadline,
    ) -> Result<Vec<ChatMessage>, ChatStoreError>;

    /// Delete messages whose `expires_at <= now`; returns how many.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, ChatStoreError>;
}

/// Non-queueing write admission.
#[derive(Debug, Clone)]
pub(crate) struct WriteAdmission {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl WriteAdmission {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Take a permit or fail with `WriteOverload`.
    pub(crate) fn try_admit(&self) -> Result<OwnedSemaphorePermit, ChatStoreError> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| ChatStoreError::WriteOverload)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.permits.available_permits())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_rejects_without_queueing() {
        let admission = WriteAdmission::new(2);
        let first = admission.try_admit().unwrap();
        let _second = admission.try_admit().unwrap();
        assert_eq!(admission.in_flight(), 2);

        assert_eq!(
            admission.try_admit().unwrap_err(),
            ChatStoreError::WriteOverload
        );

        drop(first);
        assert!(admission.try_admit().is_ok());
    }
}
