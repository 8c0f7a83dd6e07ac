//! Hold times between layer changes.
//!
//! A downgrade is allowed once [`DOWNGRADE_HOLD`] has passed since the last
//! change, an upgrade once [`UPGRADE_HOLD`] has. A viewer with no recorded
//! change is unconstrained.

use crate::layers::QualityLayer;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum time since the last change before moving down.
pub const DOWNGRADE_HOLD: Duration = Duration::from_secs(5);

/// Minimum time since the last change before moving up.
pub const UPGRADE_HOLD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HysteresisReason {
    /// No previous change recorded.
    FirstDecision,
    /// Hold time elapsed.
    HoldElapsed,
    /// Still inside the downgrade hold.
    DowngradeHeld { remaining: Duration },
    /// Still inside the upgrade hold.
    UpgradeHeld { remaining: Duration },
    /// Proposed equals current.
    NoChange,
}

impl HysteresisReason {
    /// Metric label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HysteresisReason::FirstDecision => "first_decision",
            HysteresisReason::HoldElapsed => "hold_elapsed",
            HysteresisReason::DowngradeHeld { .. } => "downgrade_held",
            HysteresisReason::UpgradeHeld { .. } => "upgrade_held",
            HysteresisReason::NoChange => "no_change",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HysteresisDecision {
    /// Layer to use from now on.
    pub new_layer: QualityLayer,
    /// Whether the proposed change may happen now.
    pub allowed: bool,
    pub reason: HysteresisReason,
    /// Last change time after this decision.
    pub last_change_at: Option<Instant>,
}

/// Gate a proposed layer change.
#[must_use]
pub fn apply_hysteresis(
    proposed: QualityLayer,
    current: QualityLayer,
    last_change_at: Option<Instant>,
    now: Instant,
) -> HysteresisDecision {
    if proposed == current {
        return HysteresisDecision {
            new_layer: current,
            allowed: false,
            reason: HysteresisReason::NoChange,
            last_change_at,
        };
    }

    let Some(last) = last_change_at else {
        return HysteresisDecision {
            new_layer: proposed,
            allowed: true,
            reason: HysteresisReason::FirstDecision,
            last_change_at: Some(now),
        };
    };

    let hold = if proposed < current {
        DOWNGRADE_HOLD
    } else {
        UPGRADE_HOLD
    };
    let elapsed = now.saturating_duration_since(last);

    if elapsed >= hold {
        return HysteresisDecision {
            new_layer: proposed,
            allowed: true,
            reason: HysteresisReason::HoldElapsed,
            last_change_at: Some(now),
        };
    }

    let remaining = hold - elapsed;
    let reason = if proposed < current {
        HysteresisReason::DowngradeHeld { remaining }
    } else {
        HysteresisReason::UpgradeHeld { remaining }
    };

    HysteresisDecision {
        new_layer: current,
        allowed: false,
        reason,
        last_change_at,
    }
}
