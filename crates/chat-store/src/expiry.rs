//! Chat expiry background task.
//!
//! Deletes messages past `expires_at` on a fixed interval. Reads do not
//! filter expired rows, so a message stays visible until the next sweep.

use crate::metrics;
use crate::store::ChatStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default sweep interval in seconds.
pub const DEFAULT_EXPIRY_INTERVAL_SECONDS: u64 = 60;

/// Start the expiry sweep.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "sc.task.chat_expiry")]
pub async fn start_chat_expiry(
    store: Arc<dyn ChatStore>,
    sweep_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sc.task.chat_expiry",
        interval_secs = sweep_interval.as_secs(),
        "Starting chat expiry task"
    );

    let mut interval = tokio::time::interval(sweep_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_sweep(store.as_ref()).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sc.task.chat_expiry",
                    "Chat expiry received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(target: "sc.task.chat_expiry", "Chat expiry stopped");
}

/// One sweep. Returns the number of messages removed (zero on error).
pub async fn run_sweep(store: &dyn ChatStore) -> u64 {
    match store.purge_expired(Utc::now()).await {
        Ok(removed) => {
            if removed > 0 {
                debug!(
                    target: "sc.task.chat_expiry",
                    removed,
                    "Purged expired chat messages"
                );
            }
            metrics::record_chat_expiry("success", removed);
            removed
        }
        Err(e) => {
            warn!(
                target: "sc.task.chat_expiry",
                error = %e,
                "Failed to purge expired chat messages"
            );
            metrics::record_chat_expiry(e.error_code(), 0);
            0
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::memory::PartitionedChatStore;
    use crate::models::NewChatMessage;
    use common::deadline::Deadline;

    async fn seeded_store() -> Arc<PartitionedChatStore> {
        let store = Arc::new(PartitionedChatStore::default());
        let month_ago = Utc::now() - chrono::Duration::days(31);
        store
            .insert_written_at(
                NewChatMessage::text("X", "alice", "old").at(month_ago),
                month_ago,
            )
            .unwrap();
        store
            .create(
                NewChatMessage::text("X", "bob", "new"),
                Deadline::after(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_run_sweep_removes_expired() {
        let store = seeded_store().await;

        assert_eq!(run_sweep(store.as_ref()).await, 1);
        assert_eq!(store.message_count("X"), 1);
        assert_eq!(run_sweep(store.as_ref()).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_sweeps_then_exits_on_cancel() {
        let store = seeded_store().await;
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(start_chat_expiry(
            store.clone(),
            Duration::from_secs(60),
            cancel_token.clone(),
        ));

        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.message_count("X"), 1);

        cancel_token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should exit")
            .unwrap();
    }
}
