//! Transport statistics reported by the media transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One periodic statistics report for a viewer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub timestamp: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub jitter_ms: f64,
    pub round_trip_time_ms: f64,
    pub available_bitrate_kbps: f64,
}

impl TransportStats {
    /// Report with only an available bitrate set; counters zero.
    #[must_use]
    pub fn with_bitrate(available_bitrate_kbps: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            packets_lost: 0,
            jitter_ms: 0.0,
            round_trip_time_ms: 0.0,
            available_bitrate_kbps,
        }
    }

    /// `packets_lost / packets_sent`, in `[0, 1]`; zero when nothing was sent.
    #[must_use]
    pub fn packet_loss_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.packets_lost as f64 / self.packets_sent as f64;
        rate.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_rate() {
        let mut stats = TransportStats::with_bitrate(1000.0);
        assert!(stats.packet_loss_rate().abs() < f64::EPSILON);

        stats.packets_sent = 200;
        stats.packets_lost = 10;
        assert!((stats.packet_loss_rate() - 0.05).abs() < 1e-9);

        // Lost can exceed sent when counters reset mid-interval
        stats.packets_lost = 500;
        assert!((stats.packet_loss_rate() - 1.0).abs() < f64::EPSILON);
    }
}
