//! Stream Controller background tasks.

use crate::controller::StreamController;
use crate::errors::StreamControllerError;
use crate::lifecycle_store::TransitionSubscription;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Start the lifecycle consumer: every transition applied by any replica is
/// folded into this one, and an ended stream's local viewers are released.
///
/// Subscribes before returning so callers know transitions applied
/// afterwards will be seen.
///
/// # Errors
///
/// Returns the store error if the subscription cannot be created.
pub async fn start_lifecycle_consumer(
    controller: Arc<StreamController>,
    cancel_token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>, StreamControllerError> {
    let subscription = controller.subscribe_shared_transitions().await?;

    info!(
        target: "sc.task.lifecycle",
        "Subscribed to stream lifecycle transitions"
    );

    Ok(tokio::spawn(run_consumer(
        controller,
        subscription,
        cancel_token,
    )))
}

#[instrument(skip_all, name = "sc.task.lifecycle")]
async fn run_consumer(
    controller: Arc<StreamController>,
    mut subscription: TransitionSubscription,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            received = subscription.recv() => {
                let Some(transition) = received else {
                    warn!(
                        target: "sc.task.lifecycle",
                        "Lifecycle subscription closed, relying on store reads at connect"
                    );
                    break;
                };
                let changed = controller.apply_transition(&transition).await;
                debug!(
                    target: "sc.task.lifecycle",
                    stream_id = %transition.stream_id,
                    state = transition.state.as_str(),
                    changed = changed,
                    "Lifecycle transition received"
                );
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "sc.task.lifecycle",
                    "Lifecycle consumer received shutdown signal, exiting"
                );
                break;
            }
        }
    }

    info!(
        target: "sc.task.lifecycle",
        "Lifecycle consumer stopped"
    );
}
