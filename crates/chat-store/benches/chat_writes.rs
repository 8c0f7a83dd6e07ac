//! Write and page-read throughput of the in-memory chat store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chat_store::{ChatStore, NewChatMessage, PartitionedChatStore};
use common::deadline::Deadline;
use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Duration;

fn bench_create(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = PartitionedChatStore::default();

    c.bench_function("chat_create", |b| {
        b.iter(|| {
            runtime.block_on(async {
                store
                    .create(
                        NewChatMessage::text("bench-stream", "viewer", "hello chat"),
                        Deadline::after(Duration::from_millis(50)),
                    )
                    .await
                    .unwrap()
            })
        });
    });
}

fn bench_list_latest(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = PartitionedChatStore::default();
    runtime.block_on(async {
        for i in 0..10_000 {
            store
                .create(
                    NewChatMessage::text("bench-stream", "viewer", format!("message {i}")),
                    Deadline::after(Duration::from_secs(1)),
                )
                .await
                .unwrap();
        }
    });

    c.bench_function("chat_list_latest_50", |b| {
        b.iter(|| {
            runtime.block_on(async {
                store
                    .list_by_stream(
                        "bench-stream",
                        50,
                        None,
                        Deadline::after(Duration::from_millis(100)),
                    )
                    .await
                    .unwrap()
            })
        });
    });
}

criterion_group!(benches, bench_create, bench_list_latest);
criterion_main!(benches);
