//! Periodic viewer membership resync.
//!
//! Recounts every stream this replica knows about, plus every stream the
//! membership ledger holds, correcting drift from lost or lagged pub/sub
//! messages. A replica that started after viewers joined learns their
//! streams from the ledger.

use crate::coordinator::Coordinator;
use common::deadline::Deadline;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Default resync interval in seconds.
pub const DEFAULT_RESYNC_INTERVAL_SECONDS: u64 = 30;

/// Per-stream deadline for a ledger read during resync.
const RESYNC_STREAM_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for listing the ledger's streams.
const RESYNC_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the resync task.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "sc.task.viewer_resync")]
pub async fn start_viewer_resync(
    coordinator: Arc<Coordinator>,
    resync_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sc.task.viewer_resync",
        interval_secs = resync_interval.as_secs(),
        "Starting viewer resync task"
    );

    let mut interval = tokio::time::interval(resync_interval);
    // The first tick completes immediately; skip it so startup is not a resync.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_resync(&coordinator).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sc.task.viewer_resync",
                    "Viewer resync task received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(
        target: "sc.task.viewer_resync",
        "Viewer resync task stopped"
    );
}

/// Resync every known or ledger-held stream once. Returns how many
/// streams succeeded.
pub async fn run_resync(coordinator: &Coordinator) -> usize {
    let streams = match coordinator
        .resync_targets(Deadline::after(RESYNC_LIST_TIMEOUT))
        .await
    {
        Ok(streams) => streams,
        Err(e) => {
            error!(
                target: "sc.task.viewer_resync",
                error = %e,
                "Failed to list ledger streams, resyncing known streams only"
            );
            coordinator.known_streams()
        }
    };
    let mut synced = 0;

    for stream_id in &streams {
        match coordinator
            .sync_viewer_count(stream_id, Deadline::after(RESYNC_STREAM_TIMEOUT))
            .await
        {
            Ok(count) => {
                synced += 1;
                debug!(
                    target: "sc.task.viewer_resync",
                    stream_id = %stream_id,
                    count = count,
                    "Stream resynced"
                );
            }
            Err(e) => {
                // Keep going, the next pass retries
                error!(
                    target: "sc.task.viewer_resync",
                    stream_id = %stream_id,
                    error = %e,
                    "Failed to resync stream"
                );
            }
        }
    }

    synced
}
