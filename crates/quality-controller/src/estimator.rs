//! Bandwidth estimation.
//!
//! Smooths `available_bitrate_kbps` with an EWMA and applies multiplicative
//! penalties when the connection shows congestion:
//!
//! - loss rate above `loss_threshold`: `* (1 - 0.5 * loss_rate)`
//! - round-trip time above `rtt_threshold_ms`: `* rtt_penalty`
//!
//! The first sample initializes the estimate from the raw report with no
//! smoothing; penalties still apply.
//!
//! Smoothing only slows rises. A report below the running EWMA is taken as
//! the estimate directly, so a collapsed link is acted on as soon as the
//! downgrade hold allows instead of after the average decays.

use crate::stats::TransportStats;
use serde::{Deserialize, Serialize};

/// Default EWMA weight of the newest sample.
pub const DEFAULT_EWMA_ALPHA: f64 = 0.3;

/// Default loss rate above which the loss penalty applies.
pub const DEFAULT_LOSS_THRESHOLD: f64 = 0.05;

/// Default RTT above which the RTT penalty applies.
pub const DEFAULT_RTT_THRESHOLD_MS: f64 = 400.0;

/// Default multiplier applied on high RTT.
pub const DEFAULT_RTT_PENALTY: f64 = 0.85;

/// Estimator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Weight of the newest sample, in `(0, 1]`.
    pub alpha: f64,
    pub loss_threshold: f64,
    pub rtt_threshold_ms: f64,
    pub rtt_penalty: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_EWMA_ALPHA,
            loss_threshold: DEFAULT_LOSS_THRESHOLD,
            rtt_threshold_ms: DEFAULT_RTT_THRESHOLD_MS,
            rtt_penalty: DEFAULT_RTT_PENALTY,
        }
    }
}

/// Smoothed view of a viewer's connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthEstimate {
    /// `min(raw, ewma)` after penalties, in kbps.
    pub smoothed_kbps: f64,
    /// EWMA before penalties; carried forward as the smoothing base.
    pub ewma_kbps: f64,
    pub packet_loss_rate: f64,
    pub round_trip_time_ms: f64,
    pub loss_penalized: bool,
    pub rtt_penalized: bool,
    /// Reports folded into this estimate.
    pub samples: u64,
}

impl BandwidthEstimate {
    /// Whether any congestion penalty was applied.
    #[must_use]
    pub fn is_congested(&self) -> bool {
        self.loss_penalized || self.rtt_penalized
    }
}

/// Fold one report into the previous estimate.
///
/// Non-finite or negative bitrates are read as zero, and an out-of-range
/// alpha is clamped into `(0, 1]`.
#[must_use]
pub fn estimate_bandwidth(
    stats: &TransportStats,
    previous: Option<&BandwidthEstimate>,
    config: &EstimatorConfig,
) -> BandwidthEstimate {
    let raw = if stats.available_bitrate_kbps.is_finite() {
        stats.available_bitrate_kbps.max(0.0)
    } else {
        0.0
    };
    let alpha = if config.alpha.is_finite() {
        config.alpha.clamp(f64::MIN_POSITIVE, 1.0)
    } else {
        DEFAULT_EWMA_ALPHA
    };

    let (ewma, samples) = match previous {
        Some(prev) => (alpha * raw + (1.0 - alpha) * prev.ewma_kbps, prev.samples + 1),
        None => (raw, 1),
    };

    let loss_rate = stats.packet_loss_rate();
    let loss_penalized = loss_rate > config.loss_threshold;
    let rtt_penalized = stats.round_trip_time_ms > config.rtt_threshold_ms;

    let mut smoothed = ewma.min(raw);
    if loss_penalized {
        smoothed *= 1.0 - 0.5 * loss_rate;
    }
    if rtt_penalized {
        smoothed *= config.rtt_penalty;
    }

    BandwidthEstimate {
        smoothed_kbps: smoothed,
        ewma_kbps: ewma,
        packet_loss_rate: loss_rate,
        round_trip_time_ms: stats.round_trip_time_ms,
        loss_penalized,
        rtt_penalized,
        samples,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_first_sample_initializes_directly() {
        let est = estimate_bandwidth(
            &TransportStats::with_bitrate(3000.0),
            None,
            &EstimatorConfig::default(),
        );
        assert!(approx(est.smoothed_kbps, 3000.0));
        assert_eq!(est.samples, 1);
        assert!(!est.is_congested());
    }

    #[test]
    fn test_ewma_uses_alpha() {
        let config = EstimatorConfig::default();
        let first = estimate_bandwidth(&TransportStats::with_bitrate(3000.0), None, &config);
        let second =
            estimate_bandwidth(&TransportStats::with_bitrate(400.0), Some(&first), &config);

        // 0.3 * 400 + 0.7 * 3000
        assert!(approx(second.ewma_kbps, 2220.0));
        assert_eq!(second.samples, 2);
    }

    #[test]
    fn test_drop_takes_raw_sample() {
        let config = EstimatorConfig::default();
        let first = estimate_bandwidth(&TransportStats::with_bitrate(3000.0), None, &config);
        let second =
            estimate_bandwidth(&TransportStats::with_bitrate(400.0), Some(&first), &config);

        assert!(approx(second.smoothed_kbps, 400.0));
        assert!(approx(second.ewma_kbps, 2220.0));
    }

    #[test]
    fn test_recovery_is_smoothed() {
        let config = EstimatorConfig::default();
        let low = estimate_bandwidth(&TransportStats::with_bitrate(400.0), None, &config);
        let recovered =
            estimate_bandwidth(&TransportStats::with_bitrate(3000.0), Some(&low), &config);

        // 0.3 * 3000 + 0.7 * 400
        assert!(approx(recovered.smoothed_kbps, 1180.0));
    }

    #[test]
    fn test_loss_penalty_above_threshold() {
        let mut stats = TransportStats::with_bitrate(1000.0);
        stats.packets_sent = 100;
        stats.packets_lost = 10;

        let est = estimate_bandwidth(&stats, None, &EstimatorConfig::default());
        assert!(est.loss_penalized);
        // 1000 * (1 - 0.5 * 0.1)
        assert!(approx(est.smoothed_kbps, 950.0));
        // Penalty does not leak into the smoothing base
        assert!(approx(est.ewma_kbps, 1000.0));
    }

    #[test]
    fn test_loss_at_threshold_is_not_penalized() {
        let mut stats = TransportStats::with_bitrate(1000.0);
        stats.packets_sent = 100;
        stats.packets_lost = 5;

        let est = estimate_bandwidth(&stats, None, &EstimatorConfig::default());
        assert!(!est.loss_penalized);
        assert!(approx(est.smoothed_kbps, 1000.0));
    }

    #[test]
    fn test_rtt_penalty_above_threshold() {
        let mut stats = TransportStats::with_bitrate(1000.0);
        stats.round_trip_time_ms = 450.0;

        let est = estimate_bandwidth(&stats, None, &EstimatorConfig::default());
        assert!(est.rtt_penalized);
        assert!(approx(est.smoothed_kbps, 850.0));
    }

    #[test]
    fn test_both_penalties_compound() {
        let mut stats = TransportStats::with_bitrate(2000.0);
        stats.packets_sent = 100;
        stats.packets_lost = 20;
        stats.round_trip_time_ms = 800.0;

        let est = estimate_bandwidth(&stats, None, &EstimatorConfig::default());
        // 2000 * 0.9 * 0.85
        assert!(approx(est.smoothed_kbps, 1530.0));
    }

    #[test]
    fn test_invalid_bitrate_reads_as_zero() {
        let config = EstimatorConfig::default();
        let nan = estimate_bandwidth(&TransportStats::with_bitrate(f64::NAN), None, &config);
        assert!(approx(nan.smoothed_kbps, 0.0));

        let negative =
            estimate_bandwidth(&TransportStats::with_bitrate(-50.0), None, &config);
        assert!(approx(negative.smoothed_kbps, 0.0));
    }

    #[test]
    fn test_alpha_one_tracks_raw() {
        let config = EstimatorConfig {
            alpha: 1.0,
            ..EstimatorConfig::default()
        };
        let first = estimate_bandwidth(&TransportStats::with_bitrate(3000.0), None, &config);
        let second =
            estimate_bandwidth(&TransportStats::with_bitrate(400.0), Some(&first), &config);
        assert!(approx(second.smoothed_kbps, 400.0));
    }
}
