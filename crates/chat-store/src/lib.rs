//! Chat message storage for live streams.
//!
//! Messages are partitioned by `stream_id` and clustered newest-first by
//! `(created_at, message_id)`. Every message carries an `expires_at` set
//! at write time; expiry is a storage-layer sweep ([`expiry`]), reads
//! never recompute TTL.
//!
//! Writes are admission-controlled: when the in-flight limit is reached a
//! write fails immediately with [`ChatStoreError::WriteOverload`] instead
//! of queueing.
//!
//! Two backends implement [`ChatStore`]:
//!
//! - [`PartitionedChatStore`]: in-process, partitions spread over a fixed
//!   number of lock shards
//! - [`PgChatStore`]: PostgreSQL table hash-partitioned by `stream_id`

pub mod errors;
pub mod expiry;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod postgres;
pub mod store;

pub use errors::ChatStoreError;
pub use memory::PartitionedChatStore;
pub use models::{
    ChatCursor, ChatMessage, ChatPage, MessageType, ModerationStatus, NewChatMessage,
    CHAT_MESSAGE_TTL, MAX_MESSAGE_LENGTH, MAX_PAGE_SIZE,
};
pub use postgres::PgChatStore;
pub use store::{ChatStore, DEFAULT_MAX_INFLIGHT_WRITES};
