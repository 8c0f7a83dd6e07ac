//! End-to-end history and load behavior of the in-memory chat store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use chat_store::{ChatStore, NewChatMessage, PartitionedChatStore};
use chrono::Utc;
use common::deadline::Deadline;
use sc_test_utils::chat_burst;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

#[tokio::test]
async fn test_hundred_messages_latest_fifty() {
    let store = PartitionedChatStore::default();
    let base = Utc::now() - chrono::Duration::minutes(5);

    for msg in chat_burst("X", base, 100) {
        store.create(msg, deadline()).await.unwrap();
    }

    let page = store.list_by_stream("X", 50, None, deadline()).await.unwrap();

    assert_eq!(page.messages.len(), 50);
    let expected: Vec<String> = (50..100).rev().map(|i| format!("message {i}")).collect();
    let actual: Vec<String> = page.messages.iter().map(|m| m.text.clone()).collect();
    assert_eq!(actual, expected);

    let older = store
        .list_by_stream("X", 50, page.next_cursor, deadline())
        .await
        .unwrap();
    assert_eq!(older.messages.len(), 50);
    assert_eq!(older.messages[0].text, "message 49");
}

async fn run_writers(writers: usize, messages_each: usize) -> (usize, Vec<Duration>) {
    let store = Arc::new(PartitionedChatStore::default());
    let mut handles = Vec::with_capacity(writers);

    for writer in 0..writers {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let stream = format!("stream-{}", writer % 16);
            let mut failures = 0usize;
            let mut latencies = Vec::with_capacity(messages_each);
            for n in 0..messages_each {
                let msg = NewChatMessage::text(&stream, format!("w{writer}"), format!("m{n}"));
                let start = Instant::now();
                if store.create(msg, Deadline::after(Duration::from_millis(50))).await.is_err() {
                    failures += 1;
                }
                latencies.push(start.elapsed());
                tokio::task::yield_now().await;
            }
            (failures, latencies)
        }));
    }

    let mut failures = 0;
    let mut latencies = Vec::with_capacity(writers * messages_each);
    for handle in handles {
        let (f, l) = handle.await.unwrap();
        failures += f;
        latencies.extend(l);
    }
    latencies.sort();
    (failures, latencies)
}

fn p99(sorted: &[Duration]) -> Duration {
    let idx = (sorted.len() * 99 / 100).min(sorted.len() - 1);
    sorted[idx]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_no_failures() {
    let (failures, latencies) = run_writers(200, 50).await;

    assert_eq!(failures, 0);
    assert_eq!(latencies.len(), 10_000);
    assert!(
        p99(&latencies) <= Duration::from_millis(5),
        "p99 write latency {:?}",
        p99(&latencies)
    );
}

// Full-size run: 1,000 writers at 100 msgs/sec for 10 s.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "load test, run with --ignored --release"]
async fn test_thousand_writers_paced() {
    let store = Arc::new(PartitionedChatStore::default());
    let mut handles = Vec::with_capacity(1000);

    for writer in 0..1000 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let stream = format!("stream-{}", writer % 64);
            let mut ticker = tokio::time::interval(Duration::from_millis(10));
            let mut failures = 0usize;
            let mut latencies = Vec::with_capacity(1000);
            for n in 0..1000 {
                ticker.tick().await;
                let msg = NewChatMessage::text(&stream, format!("w{writer}"), format!("m{n}"));
                let start = Instant::now();
                if store.create(msg, Deadline::after(Duration::from_millis(50))).await.is_err() {
                    failures += 1;
                }
                latencies.push(start.elapsed());
            }
            (failures, latencies)
        }));
    }

    let mut failures = 0;
    let mut latencies = Vec::new();
    for handle in handles {
        let (f, l) = handle.await.unwrap();
        failures += f;
        latencies.extend(l);
    }
    latencies.sort();

    assert_eq!(failures, 0);
    assert!(p99(&latencies) <= Duration::from_millis(5));
}
