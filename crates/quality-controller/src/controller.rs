//! Per-viewer quality state.
//!
//! Pure: no I/O, no clock reads. The caller supplies `now` so the same
//! state machine runs in the viewer loop and in tests.

use crate::estimator::{estimate_bandwidth, BandwidthEstimate, EstimatorConfig};
use crate::hysteresis::{apply_hysteresis, HysteresisDecision, HysteresisReason};
use crate::layers::QualityLayer;
use crate::selection::{select_quality_layer, LayerDecision};
use crate::stats::TransportStats;
use tokio::time::Instant;

/// Outcome of folding one report into a viewer's state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityDecision {
    pub estimate: BandwidthEstimate,
    pub proposal: LayerDecision,
    pub hysteresis: HysteresisDecision,
    /// Set when a switch was approved and must be dispatched.
    pub switch_to: Option<QualityLayer>,
}

impl QualityDecision {
    /// Metric label summarizing the decision.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        if self.switch_to.is_some() {
            "switched"
        } else {
            self.hysteresis.reason.as_str()
        }
    }
}

/// `(current_layer, last_change_at)` plus the running estimate.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerQualityState {
    current_layer: QualityLayer,
    last_change_at: Option<Instant>,
    estimate: Option<BandwidthEstimate>,
}

impl ViewerQualityState {
    /// Fresh state; the first approved change is not held.
    #[must_use]
    pub fn new(initial_layer: QualityLayer) -> Self {
        Self {
            current_layer: initial_layer,
            last_change_at: None,
            estimate: None,
        }
    }

    /// State whose layer was set at `changed_at`, so hold times apply
    /// from that point.
    #[must_use]
    pub fn with_last_change(initial_layer: QualityLayer, changed_at: Instant) -> Self {
        Self {
            current_layer: initial_layer,
            last_change_at: Some(changed_at),
            estimate: None,
        }
    }

    #[must_use]
    pub fn current_layer(&self) -> QualityLayer {
        self.current_layer
    }

    #[must_use]
    pub fn last_change_at(&self) -> Option<Instant> {
        self.last_change_at
    }

    #[must_use]
    pub fn estimate(&self) -> Option<&BandwidthEstimate> {
        self.estimate.as_ref()
    }

    /// Fold a report: estimate, select, gate.
    pub fn observe(
        &mut self,
        stats: &TransportStats,
        now: Instant,
        config: &EstimatorConfig,
    ) -> QualityDecision {
        let estimate = estimate_bandwidth(stats, self.estimate.as_ref(), config);
        self.estimate = Some(estimate);

        let proposal = select_quality_layer(estimate.smoothed_kbps, self.current_layer);

        let hysteresis = if proposal.should_change {
            apply_hysteresis(
                proposal.new_layer,
                self.current_layer,
                self.last_change_at,
                now,
            )
        } else {
            HysteresisDecision {
                new_layer: self.current_layer,
                allowed: false,
                reason: HysteresisReason::NoChange,
                last_change_at: self.last_change_at,
            }
        };

        let switch_to = if hysteresis.allowed {
            self.current_layer = hysteresis.new_layer;
            self.last_change_at = hysteresis.last_change_at;
            Some(hysteresis.new_layer)
        } else {
            None
        };

        QualityDecision {
            estimate,
            proposal,
            hysteresis,
            switch_to,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fresh_state_switches_immediately() {
        let mut state = ViewerQualityState::new(QualityLayer::P360);
        let decision = state.observe(
            &TransportStats::with_bitrate(3000.0),
            Instant::now(),
            &EstimatorConfig::default(),
        );

        assert_eq!(decision.switch_to, Some(QualityLayer::P1080));
        assert_eq!(decision.outcome(), "switched");
        assert_eq!(state.current_layer(), QualityLayer::P1080);
    }

    // Starting at 360p with the layer set at t0, steady 3000 kbps reaches
    // 1080p only once 10 s have passed.
    #[test]
    fn test_sustained_bandwidth_upgrades_after_hold() {
        let t0 = Instant::now();
        let mut state = ViewerQualityState::with_last_change(QualityLayer::P360, t0);
        let config = EstimatorConfig::default();

        for secs in [1, 5, 9] {
            let decision = state.observe(
                &TransportStats::with_bitrate(3000.0),
                t0 + Duration::from_secs(secs),
                &config,
            );
            assert_eq!(decision.switch_to, None, "held at {secs}s");
            assert_eq!(decision.outcome(), "upgrade_held");
        }
        assert_eq!(state.current_layer(), QualityLayer::P360);

        let decision = state.observe(
            &TransportStats::with_bitrate(3000.0),
            t0 + Duration::from_secs(10),
            &config,
        );
        assert_eq!(decision.switch_to, Some(QualityLayer::P1080));
        assert_eq!(state.current_layer(), QualityLayer::P1080);
        assert_eq!(state.last_change_at(), Some(t0 + Duration::from_secs(10)));
    }

    // At 1080p, a sudden drop to 400 kbps holds until 5 s after the last
    // change, then goes straight to 360p.
    #[test]
    fn test_sudden_drop_downgrades_after_hold() {
        let t0 = Instant::now();
        let mut state = ViewerQualityState::with_last_change(QualityLayer::P1080, t0);
        let config = EstimatorConfig::default();
        state.observe(&TransportStats::with_bitrate(3000.0), t0, &config);

        let held = state.observe(
            &TransportStats::with_bitrate(400.0),
            t0 + Duration::from_secs(2),
            &config,
        );
        assert_eq!(held.switch_to, None);
        assert_eq!(held.proposal.new_layer, QualityLayer::P360);
        assert_eq!(state.current_layer(), QualityLayer::P1080);

        let allowed = state.observe(
            &TransportStats::with_bitrate(400.0),
            t0 + Duration::from_secs(5),
            &config,
        );
        assert_eq!(allowed.switch_to, Some(QualityLayer::P360));
        assert_eq!(state.current_layer(), QualityLayer::P360);
    }

    #[test]
    fn test_single_dip_within_hold_keeps_layer() {
        let t0 = Instant::now();
        let mut state = ViewerQualityState::with_last_change(QualityLayer::P1080, t0);
        let config = EstimatorConfig::default();

        state.observe(&TransportStats::with_bitrate(3000.0), t0 + Duration::from_secs(1), &config);
        let dip = state.observe(
            &TransportStats::with_bitrate(400.0),
            t0 + Duration::from_secs(2),
            &config,
        );
        assert_eq!(dip.outcome(), "downgrade_held");

        // EWMA base 0.3 * 3000 + 0.7 * 2220 = 2454, above the 1080p floor
        let recovered = state.observe(
            &TransportStats::with_bitrate(3000.0),
            t0 + Duration::from_secs(3),
            &config,
        );
        assert!(!recovered.proposal.should_change);
        assert_eq!(state.current_layer(), QualityLayer::P1080);
        assert_eq!(state.estimate().unwrap().samples, 3);
    }
}
