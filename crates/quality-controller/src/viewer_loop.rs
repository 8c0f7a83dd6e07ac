//! Per-viewer quality control loop.
//!
//! One task per connected viewer owns that viewer's [`ViewerQualityState`].
//! The transport feeds reports through a bounded mailbox with `try_send`;
//! a saturated loop drops the report rather than stall sampling.
//!
//! Approved switches are dispatched from a separate task with bounded
//! retries, so a slow transport never delays the next decision. A newer
//! switch aborts one still in flight.

use crate::controller::ViewerQualityState;
use crate::dispatcher::{LayerSwitch, LayerSwitchDispatcher, RetryPolicy};
use crate::errors::QualityError;
use crate::estimator::{BandwidthEstimate, EstimatorConfig};
use crate::layers::QualityLayer;
use crate::metrics;
use crate::stats::TransportStats;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default mailbox size per viewer loop.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityLoopConfig {
    pub estimator: EstimatorConfig,
    pub mailbox_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for QualityLoopConfig {
    fn default() -> Self {
        Self {
            estimator: EstimatorConfig::default(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}

/// Point-in-time view of a viewer loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerQualitySnapshot {
    pub stream_id: String,
    pub viewer_id: String,
    pub current_layer: QualityLayer,
    pub last_change_at: Option<Instant>,
    pub estimate: Option<BandwidthEstimate>,
    pub switches_issued: u64,
    pub dispatch_pending: bool,
}

enum ViewerLoopMessage {
    Stats(TransportStats),
    GetSnapshot {
        respond_to: oneshot::Sender<ViewerQualitySnapshot>,
    },
}

/// Handle to a running viewer loop.
#[derive(Clone)]
pub struct ViewerLoopHandle {
    stream_id: String,
    viewer_id: String,
    sender: mpsc::Sender<ViewerLoopMessage>,
    cancel_token: CancellationToken,
    dropped_reports: Arc<AtomicU64>,
}

impl ViewerLoopHandle {
    /// Spawn a loop for one viewer starting at `initial_layer`.
    ///
    /// The loop stops when `parent_token` or this handle is cancelled.
    #[must_use]
    pub fn spawn(
        stream_id: String,
        viewer_id: String,
        initial_layer: QualityLayer,
        config: QualityLoopConfig,
        dispatcher: Arc<dyn LayerSwitchDispatcher>,
        parent_token: &CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let cancel_token = parent_token.child_token();
        let (sender, receiver) = mpsc::channel(config.mailbox_capacity.max(1));

        let actor = ViewerLoop {
            stream_id: stream_id.clone(),
            viewer_id: viewer_id.clone(),
            state: ViewerQualityState::new(initial_layer),
            config,
            dispatcher,
            receiver,
            cancel_token: cancel_token.clone(),
            pending: None,
            switches_issued: 0,
        };
        let task = tokio::spawn(actor.run());

        let handle = Self {
            stream_id,
            viewer_id,
            sender,
            cancel_token,
            dropped_reports: Arc::new(AtomicU64::new(0)),
        };
        (handle, task)
    }

    /// Queue a stats report without waiting.
    ///
    /// # Errors
    ///
    /// `MailboxFull` when the loop is behind (the report is dropped),
    /// `LoopClosed` when it has stopped.
    pub fn report_stats(&self, stats: TransportStats) -> Result<(), QualityError> {
        match self.sender.try_send(ViewerLoopMessage::Stats(stats)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_reports.fetch_add(1, Ordering::Relaxed);
                metrics::record_stats_dropped();
                debug!(
                    target: "sc.quality.loop",
                    stream_id = %self.stream_id,
                    viewer_id = %self.viewer_id,
                    "Viewer loop mailbox full, dropping stats report"
                );
                Err(QualityError::MailboxFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QualityError::LoopClosed),
        }
    }

    /// Current state of the loop.
    ///
    /// # Errors
    ///
    /// `LoopClosed` when the loop has stopped.
    pub async fn snapshot(&self) -> Result<ViewerQualitySnapshot, QualityError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ViewerLoopMessage::GetSnapshot { respond_to: tx })
            .await
            .map_err(|_| QualityError::LoopClosed)?;

        rx.await.map_err(|_| QualityError::LoopClosed)
    }

    /// Reports dropped because the mailbox was full.
    #[must_use]
    pub fn dropped_reports(&self) -> u64 {
        self.dropped_reports.load(Ordering::Relaxed)
    }

    /// Stop the loop and abort any pending dispatch.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }
}

struct ViewerLoop {
    stream_id: String,
    viewer_id: String,
    state: ViewerQualityState,
    config: QualityLoopConfig,
    dispatcher: Arc<dyn LayerSwitchDispatcher>,
    receiver: mpsc::Receiver<ViewerLoopMessage>,
    cancel_token: CancellationToken,
    pending: Option<JoinHandle<()>>,
    switches_issued: u64,
}

impl ViewerLoop {
    #[instrument(skip_all, name = "sc.quality.loop", fields(stream_id = %self.stream_id, viewer_id = %self.viewer_id))]
    async fn run(mut self) {
        metrics::record_loop_started();
        debug!(target: "sc.quality.loop", layer = %self.state.current_layer(), "Viewer loop started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    break;
                }
                message = self.receiver.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                }
            }
        }

        if let Some(pending) = self.pending.take() {
            pending.abort();
        }
        metrics::record_loop_stopped();
        debug!(
            target: "sc.quality.loop",
            switches_issued = self.switches_issued,
            "Viewer loop stopped"
        );
    }

    fn handle_message(&mut self, message: ViewerLoopMessage) {
        match message {
            ViewerLoopMessage::Stats(stats) => self.handle_stats(&stats),
            ViewerLoopMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    fn handle_stats(&mut self, stats: &TransportStats) {
        let decision = self
            .state
            .observe(stats, Instant::now(), &self.config.estimator);
        metrics::record_quality_decision(decision.outcome());

        if let Some(layer) = decision.switch_to {
            info!(
                target: "sc.quality.loop",
                direction = decision.proposal.reason.as_str(),
                layer = %layer,
                estimate_kbps = decision.estimate.smoothed_kbps,
                congested = decision.estimate.is_congested(),
                "Layer change approved"
            );
            self.dispatch_switch(layer);
        }
    }

    fn dispatch_switch(&mut self, layer: QualityLayer) {
        if let Some(previous) = self.pending.take() {
            if !previous.is_finished() {
                previous.abort();
                metrics::record_layer_switch("superseded", 0, std::time::Duration::ZERO);
                debug!(target: "sc.quality.loop", "Superseded pending layer switch");
            }
        }

        let switch = LayerSwitch {
            stream_id: self.stream_id.clone(),
            viewer_id: self.viewer_id.clone(),
            layer,
            issued_at: Utc::now(),
        };
        self.switches_issued += 1;
        self.pending = Some(tokio::spawn(dispatch_with_retry(
            Arc::clone(&self.dispatcher),
            switch,
            self.config.retry,
        )));
    }

    fn snapshot(&self) -> ViewerQualitySnapshot {
        ViewerQualitySnapshot {
            stream_id: self.stream_id.clone(),
            viewer_id: self.viewer_id.clone(),
            current_layer: self.state.current_layer(),
            last_change_at: self.state.last_change_at(),
            estimate: self.state.estimate().copied(),
            switches_issued: self.switches_issued,
            dispatch_pending: self.pending.as_ref().is_some_and(|p| !p.is_finished()),
        }
    }
}

async fn dispatch_with_retry(
    dispatcher: Arc<dyn LayerSwitchDispatcher>,
    switch: LayerSwitch,
    retry: RetryPolicy,
) {
    let start = Instant::now();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match dispatcher.dispatch(&switch).await {
            Ok(()) => {
                metrics::record_layer_switch("success", attempt, start.elapsed());
                debug!(
                    target: "sc.quality.loop",
                    viewer_id = %switch.viewer_id,
                    layer = %switch.layer,
                    attempt,
                    "Layer switch dispatched"
                );
                return;
            }
            Err(e) if attempt >= max_attempts => {
                metrics::record_layer_switch(e.error_code(), attempt, start.elapsed());
                warn!(
                    target: "sc.quality.loop",
                    viewer_id = %switch.viewer_id,
                    layer = %switch.layer,
                    attempts = attempt,
                    error = %e,
                    "Layer switch failed, giving up"
                );
                return;
            }
            Err(e) => {
                debug!(
                    target: "sc.quality.loop",
                    viewer_id = %switch.viewer_id,
                    attempt,
                    error = %e,
                    "Layer switch failed, retrying"
                );
                tokio::time::sleep(retry.backoff(attempt)).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::dispatcher::ChannelDispatcher;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every attempt; fails or hangs per layer.
    #[derive(Default)]
    struct ScriptedDispatcher {
        attempts: Mutex<Vec<QualityLayer>>,
        delivered: Mutex<Vec<QualityLayer>>,
        fail: Vec<QualityLayer>,
        hang: Vec<QualityLayer>,
    }

    #[async_trait]
    impl LayerSwitchDispatcher for ScriptedDispatcher {
        async fn dispatch(&self, switch: &LayerSwitch) -> Result<(), QualityError> {
            self.attempts.lock().unwrap().push(switch.layer);
            if self.hang.contains(&switch.layer) {
                std::future::pending::<()>().await;
            }
            if self.fail.contains(&switch.layer) {
                return Err(QualityError::Dispatch("sfu unreachable".to_string()));
            }
            self.delivered.lock().unwrap().push(switch.layer);
            Ok(())
        }
    }

    fn raw_config() -> QualityLoopConfig {
        QualityLoopConfig {
            estimator: EstimatorConfig {
                alpha: 1.0,
                ..EstimatorConfig::default()
            },
            ..QualityLoopConfig::default()
        }
    }

    fn spawn_loop(
        config: QualityLoopConfig,
        dispatcher: Arc<dyn LayerSwitchDispatcher>,
    ) -> (ViewerLoopHandle, JoinHandle<()>) {
        ViewerLoopHandle::spawn(
            "stream-1".to_string(),
            "viewer-1".to_string(),
            QualityLayer::P360,
            config,
            dispatcher,
            &CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_drive_layer_switch() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel(8);
        let (handle, _task) = spawn_loop(QualityLoopConfig::default(), Arc::new(dispatcher));

        handle
            .report_stats(TransportStats::with_bitrate(3000.0))
            .unwrap();

        let switch = rx.recv().await.unwrap();
        assert_eq!(switch.layer, QualityLayer::P1080);
        assert_eq!(switch.viewer_id, "viewer-1");

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current_layer, QualityLayer::P1080);
        assert_eq!(snapshot.switches_issued, 1);
        assert!(snapshot.estimate.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_changes_are_not_dispatched() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel(8);
        let (handle, _task) = spawn_loop(QualityLoopConfig::default(), Arc::new(dispatcher));

        handle
            .report_stats(TransportStats::with_bitrate(3000.0))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().layer, QualityLayer::P1080);

        tokio::time::advance(Duration::from_secs(2)).await;
        handle
            .report_stats(TransportStats::with_bitrate(400.0))
            .unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current_layer, QualityLayer::P1080);
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(3)).await;
        handle
            .report_stats(TransportStats::with_bitrate(400.0))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().layer, QualityLayer::P360);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dispatch_retries_are_bounded() {
        let dispatcher = Arc::new(ScriptedDispatcher {
            fail: vec![QualityLayer::P1080],
            ..ScriptedDispatcher::default()
        });
        let (handle, _task) = spawn_loop(QualityLoopConfig::default(), dispatcher.clone());

        handle
            .report_stats(TransportStats::with_bitrate(3000.0))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(dispatcher.attempts.lock().unwrap().len(), 3);
        assert!(dispatcher.delivered.lock().unwrap().is_empty());

        // The decision stands even though delivery failed
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current_layer, QualityLayer::P1080);
        assert!(!snapshot.dispatch_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_switch_supersedes_pending() {
        let dispatcher = Arc::new(ScriptedDispatcher {
            hang: vec![QualityLayer::P1080],
            ..ScriptedDispatcher::default()
        });
        let (handle, _task) = spawn_loop(raw_config(), dispatcher.clone());

        handle
            .report_stats(TransportStats::with_bitrate(3000.0))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handle.snapshot().await.unwrap().dispatch_pending);

        handle
            .report_stats(TransportStats::with_bitrate(400.0))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *dispatcher.attempts.lock().unwrap(),
            vec![QualityLayer::P1080, QualityLayer::P360]
        );
        assert_eq!(*dispatcher.delivered.lock().unwrap(), vec![QualityLayer::P360]);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.current_layer, QualityLayer::P360);
        assert_eq!(snapshot.switches_issued, 2);
        assert!(!snapshot.dispatch_pending);
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_reports() {
        let (dispatcher, _rx) = ChannelDispatcher::channel(8);
        let config = QualityLoopConfig {
            mailbox_capacity: 1,
            ..QualityLoopConfig::default()
        };
        let (handle, _task) = spawn_loop(config, Arc::new(dispatcher));

        // Current-thread runtime: the loop cannot drain until we yield
        handle
            .report_stats(TransportStats::with_bitrate(1000.0))
            .unwrap();
        let err = handle
            .report_stats(TransportStats::with_bitrate(1000.0))
            .unwrap_err();
        assert_eq!(err, QualityError::MailboxFull);
        assert_eq!(
            handle.report_stats(TransportStats::with_bitrate(1000.0)),
            Err(QualityError::MailboxFull)
        );
        assert_eq!(handle.dropped_reports(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_loop() {
        let (dispatcher, _rx) = ChannelDispatcher::channel(8);
        let (handle, task) = spawn_loop(QualityLoopConfig::default(), Arc::new(dispatcher));

        handle.cancel();
        assert!(handle.is_cancelled());
        task.await.unwrap();

        assert_eq!(
            handle.report_stats(TransportStats::with_bitrate(1000.0)),
            Err(QualityError::LoopClosed)
        );
        assert_eq!(handle.snapshot().await, Err(QualityError::LoopClosed));
    }
}
