//! Viewer event consumer.
//!
//! Subscribes to every stream's viewer topic and applies events to this
//! replica's membership. The replica's own events arrive here too and are
//! deduplicated, since they were already applied on publish.

use crate::coordinator::Coordinator;
use crate::errors::CoordinatorError;
use crate::events::ALL_STREAMS_PATTERN;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Start the viewer event consumer.
///
/// Subscribes before returning so callers know events published afterwards
/// will be seen.
///
/// # Errors
///
/// Returns the bus error if the subscription cannot be created.
pub async fn start_viewer_event_consumer(
    coordinator: Arc<Coordinator>,
    cancel_token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, CoordinatorError> {
    let subscription = coordinator.bus().subscribe(ALL_STREAMS_PATTERN).await?;

    info!(
        target: "sc.task.viewer_events",
        pattern = ALL_STREAMS_PATTERN,
        "Subscribed to viewer events"
    );

    Ok(tokio::spawn(run_consumer(
        coordinator,
        subscription,
        cancel_token,
    )))
}

#[instrument(skip_all, name = "sc.task.viewer_events")]
async fn run_consumer(
    coordinator: Arc<Coordinator>,
    mut subscription: crate::bus::EventSubscription,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            received = subscription.recv() => {
                match received {
                    Some(event) => {
                        coordinator.apply_event(&event);
                    }
                    None => {
                        warn!(
                            target: "sc.task.viewer_events",
                            "Viewer event subscription closed, relying on resync"
                        );
                        break;
                    }
                }
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sc.task.viewer_events",
                    "Viewer event consumer received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(
        target: "sc.task.viewer_events",
        "Viewer event consumer stopped"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryEventBus, ViewerEventBus};
    use crate::coordinator::CoordinatorConfig;
    use crate::events::ViewerEvent;
    use crate::ledger::InMemoryLedger;
    use crate::registry::ServerRegistry;
    use std::time::Duration;

    #[tokio::test]
    async fn test_remote_events_update_local_counts() {
        let bus = Arc::new(InMemoryEventBus::default());
        let coordinator = Arc::new(Coordinator::new(
            CoordinatorConfig {
                replica_id: "sc-1".to_string(),
            },
            Arc::new(ServerRegistry::default()),
            bus.clone(),
            Arc::new(InMemoryLedger::new()),
        ));
        coordinator.register_server("sfu-1", 10).unwrap();

        let cancel = CancellationToken::new();
        let handle = start_viewer_event_consumer(coordinator.clone(), cancel.clone())
            .await
            .unwrap();

        // Another replica's join, delivered twice
        let event = ViewerEvent::join("s1", "v1", "sfu-1");
        bus.publish(&event.topic(), &event).await.unwrap();
        bus.publish(&event.topic(), &event).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while coordinator.viewer_count("s1") == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        // Let the duplicate drain
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(coordinator.viewer_count("s1"), 1);
        assert_eq!(
            coordinator.registry().snapshot_of("sfu-1").unwrap().current_load,
            1
        );

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
