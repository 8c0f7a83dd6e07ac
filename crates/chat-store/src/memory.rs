//! In-process chat store.
//!
//! Each stream is a partition: a `BTreeMap` ordered by the clustering key
//! `(Reverse(created_at), Reverse(message_id))`, so a forward range scan
//! yields newest-first. Partitions live in a `DashMap` with a fixed shard
//! count; a write locks only the shard holding its stream, and reads on
//! other streams proceed in parallel.

use crate::errors::ChatStoreError;
use crate::metrics;
use crate::models::{
    effective_limit, ChatCursor, ChatMessage, ChatPage, NewChatMessage,
};
use crate::store::{ChatStore, WriteAdmission, DEFAULT_MAX_INFLIGHT_WRITES};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::deadline::Deadline;
use common::types::MessageId;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Lock shards for the partition map (power of two).
const SHARD_COUNT: usize = 64;

const BACKEND: &str = "memory";

type ClusteringKey = (Reverse<DateTime<Utc>>, Reverse<MessageId>);

fn clustering_key(created_at: DateTime<Utc>, message_id: MessageId) -> ClusteringKey {
    (Reverse(created_at), Reverse(message_id))
}

/// Last possible key at `timestamp`; everything after it is strictly older.
fn last_key_at(timestamp: DateTime<Utc>) -> ClusteringKey {
    clustering_key(timestamp, MessageId(Uuid::nil()))
}

type Partition = BTreeMap<ClusteringKey, ChatMessage>;

/// Chat store held in memory, partitioned by stream.
#[derive(Debug)]
pub struct PartitionedChatStore {
    partitions: DashMap<String, Partition>,
    admission: WriteAdmission,
}

impl Default for PartitionedChatStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INFLIGHT_WRITES)
    }
}

impl PartitionedChatStore {
    #[must_use]
    pub fn new(max_inflight_writes: usize) -> Self {
        Self {
            partitions: DashMap::with_shard_amount(SHARD_COUNT),
            admission: WriteAdmission::new(max_inflight_writes),
        }
    }

    /// Messages currently held for a stream.
    #[must_use]
    pub fn message_count(&self, stream_id: &str) -> usize {
        self.partitions.get(stream_id).map_or(0, |p| p.len())
    }

    /// Streams with at least one message.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Insert as if written at `written_at`; `create` passes the current time.
    pub(crate) fn insert_written_at(
        &self,
        message: NewChatMessage,
        written_at: DateTime<Utc>,
    ) -> Result<ChatMessage, ChatStoreError> {
        let key = clustering_key(message.created_at, message.message_id);
        let mut partition = self.partitions.entry(message.stream_id.clone()).or_default();

        match partition.entry(key) {
            Entry::Occupied(existing) => {
                if existing.get().same_content(&message) {
                    Ok(existing.get().clone())
                } else {
                    Err(ChatStoreError::Conflict(format!(
                        "{}/{}",
                        message.stream_id,
                        existing.get().cursor()
                    )))
                }
            }
            Entry::Vacant(slot) => {
                let stored = message.into_stored(written_at);
                slot.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    fn scan(
        &self,
        stream_id: &str,
        start: Bound<ClusteringKey>,
        end: Bound<ClusteringKey>,
        limit: usize,
    ) -> Vec<ChatMessage> {
        self.partitions
            .get(stream_id)
            .map(|partition| {
                partition
                    .range((start, end))
                    .take(limit)
                    .map(|(_, message)| message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn create_admitted(
        &self,
        message: NewChatMessage,
        deadline: Deadline,
    ) -> Result<ChatMessage, ChatStoreError> {
        message.validate()?;
        let _permit = self.admission.try_admit()?;
        metrics::set_chat_inflight_writes(BACKEND, self.admission.in_flight());

        deadline
            .run(async { self.insert_written_at(message, Utc::now()) })
            .await
            .map_err(ChatStoreError::write_timeout)?
    }
}

#[async_trait]
impl ChatStore for PartitionedChatStore {
    #[instrument(skip_all, fields(stream_id = %message.stream_id))]
    async fn create(
        &self,
        message: NewChatMessage,
        deadline: Deadline,
    ) -> Result<ChatMessage, ChatStoreError> {
        let start = Instant::now();
        let result = self.create_admitted(message, deadline).await;

        let status = match &result {
            Ok(_) => "success",
            Err(e) => {
                debug!(target: "sc.chat.store", error = %e, "Chat write rejected");
                e.error_code()
            }
        };
        metrics::record_chat_write(BACKEND, status, start.elapsed());
        result
    }

    #[instrument(skip_all, fields(stream_id = %stream_id, limit = limit))]
    async fn list_by_stream(
        &self,
        stream_id: &str,
        limit: usize,
        since: Option<ChatCursor>,
        deadline: Deadline,
    ) -> Result<ChatPage, ChatStoreError> {
        let start = Instant::now();
        let limit = effective_limit(limit);
        let from = match since {
            None => Bound::Unbounded,
            Some(ChatCursor {
                timestamp,
                message_id: Some(id),
            }) => Bound::Excluded(clustering_key(timestamp, id)),
            Some(ChatCursor {
                timestamp,
                message_id: None,
            }) => Bound::Excluded(last_key_at(timestamp)),
        };

        let result = deadline
            .run(async { self.scan(stream_id, from, Bound::Unbounded, limit) })
            .await
            .map(|messages| ChatPage::from_messages(messages, limit))
            .map_err(ChatStoreError::read_timeout);

        let status = result.as_ref().map_or_else(|e| e.error_code(), |_| "success");
        metrics::record_chat_read(BACKEND, "list_by_stream", status, start.elapsed());
        result
    }

    #[instrument(skip_all, fields(stream_id = %stream_id, limit = limit))]
    async fn list_range(
        &self,
        stream_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
        deadline: Deadline,
    ) -> Result<Vec<ChatMessage>, ChatStoreError> {
        let start = Instant::now();
        let limit = effective_limit(limit);

        let result = deadline
            .run(async {
                if from >= to {
                    return Vec::new();
                }
                self.scan(
                    stream_id,
                    Bound::Excluded(last_key_at(to)),
                    Bound::Included(last_key_at(from)),
                    limit,
                )
            })
            .await
            .map_err(ChatStoreError::read_timeout);

        let status = result.as_ref().map_or_else(|e| e.error_code(), |_| "success");
        metrics::record_chat_read(BACKEND, "list_range", status, start.elapsed());
        result
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, ChatStoreError> {
        let mut removed: u64 = 0;
        self.partitions.retain(|_, partition| {
            let before = partition.len();
            partition.retain(|_, message| !message.is_expired(now));
            removed += (before - partition.len()) as u64;
            !partition.is_empty()
        });
        Ok(removed)
    }
}
