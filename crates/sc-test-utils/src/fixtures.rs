//! Pre-built test data.

use chat_store::NewChatMessage;
use chrono::{DateTime, Utc};
use coordinator::bus::{InMemoryEventBus, ViewerEventBus};
use coordinator::ledger::{InMemoryLedger, MembershipLedger};
use coordinator::{Coordinator, CoordinatorConfig, ServerRegistry};
use quality_controller::TransportStats;
use std::sync::Arc;
use std::time::Duration;

/// Builder for a coordinator with a registered SFU fleet.
#[derive(Debug, Default)]
pub struct TestFleet {
    servers: Vec<(String, u32)>,
    health_timeout: Option<Duration>,
    replica_id: Option<String>,
}

impl TestFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, server_id: &str, capacity: u32) -> Self {
        self.servers.push((server_id.to_string(), capacity));
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = Some(timeout);
        self
    }

    pub fn with_replica_id(mut self, replica_id: &str) -> Self {
        self.replica_id = Some(replica_id.to_string());
        self
    }

    /// Coordinator on a fresh in-memory bus and ledger.
    pub fn build(self) -> Arc<Coordinator> {
        self.build_with(
            Arc::new(InMemoryEventBus::default()),
            Arc::new(InMemoryLedger::new()),
        )
    }

    pub fn build_with_bus(self, bus: Arc<dyn ViewerEventBus>) -> Arc<Coordinator> {
        self.build_with(bus, Arc::new(InMemoryLedger::new()))
    }

    /// Coordinator sharing a bus and ledger, e.g. a second replica.
    pub fn build_with(
        self,
        bus: Arc<dyn ViewerEventBus>,
        ledger: Arc<dyn MembershipLedger>,
    ) -> Arc<Coordinator> {
        let registry = Arc::new(match self.health_timeout {
            Some(timeout) => ServerRegistry::new(timeout),
            None => ServerRegistry::default(),
        });
        let config = CoordinatorConfig {
            replica_id: self.replica_id.unwrap_or_else(|| "sc-test".to_string()),
        };
        let coordinator = Arc::new(Coordinator::new(config, registry, bus, ledger));
        for (server_id, capacity) in &self.servers {
            coordinator.register_server(server_id, *capacity).unwrap();
        }
        coordinator
    }
}

/// Reports with the given bitrates and no loss or latency.
pub fn bitrate_series(kbps: &[f64]) -> Vec<TransportStats> {
    kbps.iter()
        .map(|k| TransportStats::with_bitrate(*k))
        .collect()
}

/// Report with packet loss and RTT set.
pub fn congested_stats(kbps: f64, packets_sent: u64, packets_lost: u64, rtt_ms: f64) -> TransportStats {
    let mut stats = TransportStats::with_bitrate(kbps);
    stats.packets_sent = packets_sent;
    stats.packets_received = packets_sent.saturating_sub(packets_lost);
    stats.packets_lost = packets_lost;
    stats.round_trip_time_ms = rtt_ms;
    stats
}

/// `count` messages one millisecond apart starting at `start`, oldest first.
pub fn chat_burst(stream_id: &str, start: DateTime<Utc>, count: i64) -> Vec<NewChatMessage> {
    (0..count)
        .map(|i| {
            NewChatMessage::text(stream_id, format!("viewer-{}", i % 10), format!("message {i}"))
                .at(start + chrono::Duration::milliseconds(i))
        })
        .collect()
}
