//! SFU health checker background task.
//!
//! Periodically marks instances whose heartbeat is older than the registry's
//! health timeout as unhealthy. Marked instances keep their registration
//! and return on the next heartbeat or re-registration.

use crate::metrics;
use crate::registry::ServerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Default check interval in seconds.
pub const DEFAULT_CHECK_INTERVAL_SECONDS: u64 = 5;

/// Start the SFU health checker.
///
/// Returns when the cancellation token is triggered.
#[instrument(skip_all, name = "sc.task.sfu_health_checker")]
pub async fn start_sfu_health_checker(
    registry: Arc<ServerRegistry>,
    check_interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "sc.task.sfu_health_checker",
        health_timeout_secs = registry.health_timeout().as_secs(),
        check_interval_secs = check_interval.as_secs(),
        "Starting SFU health checker task"
    );

    let mut interval = tokio::time::interval(check_interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_check(&registry);
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sc.task.sfu_health_checker",
                    "SFU health checker received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(
        target: "sc.task.sfu_health_checker",
        "SFU health checker stopped"
    );
}

/// One pass of the checker. Returns the number of instances newly marked.
pub fn run_check(registry: &ServerRegistry) -> usize {
    let marked = registry.mark_stale_unhealthy();

    if !marked.is_empty() {
        warn!(
            target: "sc.task.sfu_health_checker",
            stale_count = marked.len(),
            server_ids = ?marked,
            "Marked silent SFU instances as unhealthy"
        );
        metrics::record_sfu_marked_unhealthy(marked.len() as u64);
    }

    let snapshot = registry.snapshot();
    let healthy = snapshot.iter().filter(|s| s.healthy).count();
    metrics::set_sfu_instances(healthy, snapshot.len() - healthy);

    marked.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_check_interval() {
        assert_eq!(DEFAULT_CHECK_INTERVAL_SECONDS, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_check_marks_silent_instances() {
        let registry = ServerRegistry::new(Duration::from_secs(15));
        registry.register("sfu-1", 10).unwrap();
        registry.register("sfu-2", 10).unwrap();

        assert_eq!(run_check(&registry), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        registry.heartbeat("sfu-2").unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(run_check(&registry), 1);
        assert_eq!(run_check(&registry), 0, "already marked");
        assert_eq!(registry.len(), 2, "never deregistered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_exits_on_cancel() {
        let registry = Arc::new(ServerRegistry::default());
        let cancel_token = CancellationToken::new();

        let handle = tokio::spawn(start_sfu_health_checker(
            registry,
            Duration::from_secs(1),
            cancel_token.clone(),
        ));

        tokio::time::advance(Duration::from_secs(3)).await;
        cancel_token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should stop")
            .expect("task should not panic");
    }
}
