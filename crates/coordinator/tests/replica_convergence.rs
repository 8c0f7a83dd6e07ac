//! Two coordinator replicas sharing a bus and ledger converge on the same
//! membership even when the bus duplicates and reorders deliveries.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::deadline::Deadline;
use coordinator::bus::ViewerEventBus;
use coordinator::ledger::{InMemoryLedger, MembershipLedger};
use coordinator::tasks::resync::run_resync;
use coordinator::tasks::start_viewer_event_consumer;
use coordinator::Coordinator;
use sc_test_utils::{ChaoticEventBus, DownEventBus, TestFleet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(1))
}

fn loads(coordinator: &Coordinator) -> Vec<(String, u32)> {
    coordinator
        .servers()
        .into_iter()
        .map(|s| (s.server_id, s.current_load))
        .collect()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn replica(
    id: &str,
    bus: Arc<dyn ViewerEventBus>,
    ledger: Arc<dyn MembershipLedger>,
) -> Arc<Coordinator> {
    TestFleet::new()
        .with_server("sfu-a", 100)
        .with_server("sfu-b", 100)
        .with_replica_id(id)
        .build_with(bus, ledger)
}

#[tokio::test]
async fn test_replicas_converge_under_chaotic_delivery() {
    let bus = Arc::new(ChaoticEventBus::new());
    let ledger: Arc<dyn MembershipLedger> = Arc::new(InMemoryLedger::new());
    let primary = replica("sc-1", bus.clone(), ledger.clone());
    let follower = replica("sc-2", bus.clone(), ledger.clone());

    let cancel_token = CancellationToken::new();
    let consumer = start_viewer_event_consumer(follower.clone(), cancel_token.clone())
        .await
        .unwrap();

    for i in 0..20 {
        let viewer = format!("v{i}");
        let slot = primary
            .select_least_loaded_server("s1", deadline())
            .await
            .unwrap();
        primary
            .publish_viewer_join("s1", &viewer, slot.server_id(), deadline())
            .await
            .unwrap();
    }

    // Adjacent publishes are swapped: the follower sees this leave first
    primary
        .publish_viewer_join("s1", "flash", "sfu-a", deadline())
        .await
        .unwrap();
    primary
        .publish_viewer_leave("s1", "flash", "sfu-a", deadline())
        .await
        .unwrap();

    for i in 0..5 {
        let viewer = format!("v{i}");
        let server = primary.assignment("s1", &viewer).unwrap();
        primary
            .publish_viewer_leave("s1", &viewer, &server, deadline())
            .await
            .unwrap();
    }
    bus.flush().await;

    assert_eq!(primary.viewer_count("s1"), 15);
    wait_for(|| follower.viewer_count("s1") == 15).await;
    wait_for(|| loads(&follower) == loads(&primary)).await;
    assert_eq!(follower.assignment("s1", "flash"), None);

    cancel_token.cancel();
    consumer.await.unwrap();
}

#[tokio::test]
async fn test_resync_repairs_replica_that_missed_events() {
    let ledger: Arc<dyn MembershipLedger> = Arc::new(InMemoryLedger::new());
    // Neither replica can reach the broker; the ledger still records
    let primary = replica("sc-1", Arc::new(DownEventBus), ledger.clone());
    let follower = replica("sc-2", Arc::new(DownEventBus), ledger.clone());

    for i in 0..6 {
        let result = primary
            .publish_viewer_join("s1", &format!("v{i}"), "sfu-b", deadline())
            .await;
        assert!(result.is_err(), "bus failure is reported to the caller");
    }

    assert_eq!(primary.viewer_count("s1"), 6);
    assert_eq!(follower.viewer_count("s1"), 0);

    let count = follower.sync_viewer_count("s1", deadline()).await.unwrap();
    assert_eq!(count, 6);
    assert_eq!(loads(&follower), loads(&primary));
}

#[tokio::test]
async fn test_late_replica_learns_streams_from_ledger() {
    let ledger: Arc<dyn MembershipLedger> = Arc::new(InMemoryLedger::new());
    let primary = TestFleet::new()
        .with_server("sfu-a", 10)
        .with_replica_id("sc-1")
        .build_with(Arc::new(DownEventBus), ledger.clone());

    for i in 0..10 {
        let _ = primary
            .publish_viewer_join("s1", &format!("v{i}"), "sfu-a", deadline())
            .await;
    }
    assert!(primary
        .select_least_loaded_server("s1", deadline())
        .await
        .is_err());

    // Started after every join; never saw one on the bus
    let late = TestFleet::new()
        .with_server("sfu-a", 10)
        .with_replica_id("sc-2")
        .build_with(Arc::new(DownEventBus), ledger.clone());
    assert_eq!(late.viewer_count("s1"), 0);

    assert_eq!(run_resync(&late).await, 1);
    assert_eq!(late.viewer_count("s1"), 10);
    assert_eq!(loads(&late), vec![("sfu-a".to_string(), 10)]);
    assert!(late
        .select_least_loaded_server("s1", deadline())
        .await
        .is_err());
}
