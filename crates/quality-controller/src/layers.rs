//! Simulcast quality layers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A quality layer, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityLayer {
    #[serde(rename = "360p")]
    P360 = 0,
    #[serde(rename = "720p")]
    P720 = 1,
    #[serde(rename = "1080p")]
    P1080 = 2,
}

impl QualityLayer {
    /// Every layer, lowest first.
    pub const ALL: [QualityLayer; 3] = [QualityLayer::P360, QualityLayer::P720, QualityLayer::P1080];

    /// Lowest layer.
    pub const LOWEST: QualityLayer = QualityLayer::P360;

    /// Highest layer.
    pub const HIGHEST: QualityLayer = QualityLayer::P1080;

    /// Minimum bitrate that sustains this layer, in kbps.
    #[must_use]
    pub fn min_bitrate_kbps(self) -> f64 {
        match self {
            QualityLayer::P360 => 0.0,
            QualityLayer::P720 => 800.0,
            QualityLayer::P1080 => 2000.0,
        }
    }

    /// Ordinal index (0 = 360p).
    #[must_use]
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Layer for an index, clamping out-of-range values to the nearest
    /// valid layer.
    #[must_use]
    pub fn from_index_clamped(index: i64) -> Self {
        match index {
            i64::MIN..=0 => QualityLayer::P360,
            1 => QualityLayer::P720,
            _ => QualityLayer::P1080,
        }
    }

    /// Display label such as `720p`.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            QualityLayer::P360 => "360p",
            QualityLayer::P720 => "720p",
            QualityLayer::P1080 => "1080p",
        }
    }
}

impl fmt::Display for QualityLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
