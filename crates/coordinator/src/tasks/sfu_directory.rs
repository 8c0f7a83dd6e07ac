//! SFU directory sync task.
//!
//! Polls an [`SfuDirectory`] and folds fresh announcements into this
//! replica's registry: unknown instances and capacity changes register,
//! known instances heartbeat. Announcements older than the registry's
//! health timeout are ignored, so an instance that stops announcing is
//! marked unhealthy by the health checker like any silent instance.

use crate::coordinator::Coordinator;
use crate::directory::SfuDirectory;
use crate::errors::CoordinatorError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default directory poll interval in seconds.
pub const DEFAULT_SFU_SYNC_INTERVAL_SECONDS: u64 = 5;

/// Start the directory sync task.
///
/// Polls once immediately so a fresh replica has instances to select
/// before its first interval elapses. Returns when the cancellation token
/// is triggered.
#[instrument(skip_all, name = "sc.task.sfu_directory")]
pub async fn start_sfu_directory_sync(
    coordinator: Arc<Coordinator>,
    directory: Arc<dyn SfuDirectory>,
    sync_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sc.task.sfu_directory",
        interval_secs = sync_interval.as_secs(),
        "Starting SFU directory sync task"
    );

    let mut interval = tokio::time::interval(sync_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = run_directory_sync(&coordinator, directory.as_ref()).await {
                    error!(
                        target: "sc.task.sfu_directory",
                        error = %e,
                        "Failed to read SFU directory"
                    );
                }
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sc.task.sfu_directory",
                    "SFU directory sync received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(
        target: "sc.task.sfu_directory",
        "SFU directory sync stopped"
    );
}

/// One poll of the directory. Returns how many instances were refreshed.
///
/// # Errors
///
/// Returns the directory's read error. Per-instance registration failures
/// are logged and skipped.
pub async fn run_directory_sync(
    coordinator: &Coordinator,
    directory: &dyn SfuDirectory,
) -> Result<usize, CoordinatorError> {
    let announcements = directory.announcements().await?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    let max_age_ms =
        i64::try_from(coordinator.registry().health_timeout().as_millis()).unwrap_or(i64::MAX);
    let mut refreshed = 0;

    for announcement in &announcements {
        let age_ms = announcement.age_ms(now_ms);
        if age_ms > max_age_ms {
            debug!(
                target: "sc.task.sfu_directory",
                server_id = %announcement.server_id,
                age_ms = age_ms,
                "Ignoring stale SFU announcement"
            );
            continue;
        }

        let known_capacity = coordinator
            .registry()
            .snapshot_of(&announcement.server_id)
            .map(|snapshot| snapshot.capacity);

        let result = if known_capacity == Some(announcement.capacity) {
            coordinator.record_heartbeat(&announcement.server_id)
        } else {
            coordinator.register_server(&announcement.server_id, announcement.capacity)
        };

        match result {
            Ok(()) => refreshed += 1,
            Err(e) => {
                warn!(
                    target: "sc.task.sfu_directory",
                    server_id = %announcement.server_id,
                    error = %e,
                    "Rejected SFU announcement"
                );
            }
        }
    }

    Ok(refreshed)
}
