//! Target layer selection.
//!
//! The target is the highest layer whose minimum bitrate the estimate
//! meets. Layers above the current one must clear their threshold by
//! [`UPGRADE_MARGIN`]; the current layer and anything below need only the
//! plain threshold, so a viewer sitting exactly at its layer's threshold
//! stays there.

use crate::layers::QualityLayer;
use serde::{Deserialize, Serialize};

/// Headroom required before moving up a layer.
pub const UPGRADE_MARGIN: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Upgrade,
    Downgrade,
    Unchanged,
}

impl DecisionReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionReason::Upgrade => "upgrade",
            DecisionReason::Downgrade => "downgrade",
            DecisionReason::Unchanged => "unchanged",
        }
    }
}

/// Layer the estimate supports, before hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerDecision {
    pub new_layer: QualityLayer,
    pub should_change: bool,
    pub reason: DecisionReason,
}

/// Pick the target layer for a bandwidth estimate.
#[must_use]
pub fn select_quality_layer(bandwidth_kbps: f64, current: QualityLayer) -> LayerDecision {
    let bandwidth = if bandwidth_kbps.is_finite() {
        bandwidth_kbps
    } else {
        0.0
    };

    let target = QualityLayer::ALL
        .iter()
        .rev()
        .copied()
        .find(|layer| {
            let threshold = if *layer > current {
                layer.min_bitrate_kbps() * UPGRADE_MARGIN
            } else {
                layer.min_bitrate_kbps()
            };
            bandwidth >= threshold
        })
        .unwrap_or(QualityLayer::LOWEST);

    let reason = match target.cmp(&current) {
        std::cmp::Ordering::Greater => DecisionReason::Upgrade,
        std::cmp::Ordering::Less => DecisionReason::Downgrade,
        std::cmp::Ordering::Equal => DecisionReason::Unchanged,
    };

    LayerDecision {
        new_layer: target,
        should_change: target != current,
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_high_bandwidth_upgrades_to_top() {
        let decision = select_quality_layer(3000.0, QualityLayer::P360);
        assert_eq!(decision.new_layer, QualityLayer::P1080);
        assert!(decision.should_change);
        assert_eq!(decision.reason, DecisionReason::Upgrade);
    }

    #[test]
    fn test_upgrade_requires_margin() {
        // 2000 meets the 1080p floor but not 2000 * 1.2
        let decision = select_quality_layer(2000.0, QualityLayer::P720);
        assert_eq!(decision.new_layer, QualityLayer::P720);
        assert!(!decision.should_change);
        assert_eq!(decision.reason, DecisionReason::Unchanged);

        let decision = select_quality_layer(2400.0, QualityLayer::P720);
        assert_eq!(decision.new_layer, QualityLayer::P1080);
    }

    #[test]
    fn test_current_layer_needs_only_plain_threshold() {
        let decision = select_quality_layer(2000.0, QualityLayer::P1080);
        assert_eq!(decision.new_layer, QualityLayer::P1080);
        assert!(!decision.should_change);
    }

    #[test]
    fn test_margin_applies_to_intermediate_layers() {
        // 900 is above 800 but below 960 when starting from 360p
        let decision = select_quality_layer(900.0, QualityLayer::P360);
        assert_eq!(decision.new_layer, QualityLayer::P360);
        assert!(!decision.should_change);

        let decision = select_quality_layer(960.0, QualityLayer::P360);
        assert_eq!(decision.new_layer, QualityLayer::P720);
    }

    #[test]
    fn test_downgrade_to_lowest() {
        let decision = select_quality_layer(400.0, QualityLayer::P1080);
        assert_eq!(decision.new_layer, QualityLayer::P360);
        assert!(decision.should_change);
        assert_eq!(decision.reason, DecisionReason::Downgrade);
    }

    #[test]
    fn test_non_finite_bandwidth_selects_lowest() {
        let decision = select_quality_layer(f64::NAN, QualityLayer::P720);
        assert_eq!(decision.new_layer, QualityLayer::P360);
    }
}
