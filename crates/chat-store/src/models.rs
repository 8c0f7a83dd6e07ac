//! Chat message model.

use crate::errors::ChatStoreError;
use chrono::{DateTime, SubsecRound, Utc};
use common::types::MessageId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Time a message is retained after it is written.
pub const CHAT_MESSAGE_TTL: Duration = Duration::from_secs(2_592_000);

/// Longest accepted message text, in characters.
pub const MAX_MESSAGE_LENGTH: usize = 2000;

/// Largest page returned by a single read.
pub const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationStatus {
    Approved,
    Pending,
    Flagged,
    Removed,
}

impl ModerationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ModerationStatus::Approved => "approved",
            ModerationStatus::Pending => "pending",
            ModerationStatus::Flagged => "flagged",
            ModerationStatus::Removed => "removed",
        }
    }
}

impl FromStr for ModerationStatus {
    type Err = ChatStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(ModerationStatus::Approved),
            "pending" => Ok(ModerationStatus::Pending),
            "flagged" => Ok(ModerationStatus::Flagged),
            "removed" => Ok(ModerationStatus::Removed),
            other => Err(ChatStoreError::Internal(format!(
                "unknown moderation status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    System,
    Highlight,
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::System => "system",
            MessageType::Highlight => "highlight",
        }
    }
}

impl FromStr for MessageType {
    type Err = ChatStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "system" => Ok(MessageType::System),
            "highlight" => Ok(MessageType::Highlight),
            other => Err(ChatStoreError::Internal(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

/// A message as submitted by a sender, before the store stamps expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewChatMessage {
    pub stream_id: String,
    pub message_id: MessageId,
    pub sender_id: String,
    pub text: String,
    pub moderation_status: ModerationStatus,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
}

impl NewChatMessage {
    /// Plain text message stamped now with a fresh id.
    ///
    /// `created_at` is truncated to microseconds, the precision both
    /// backends store.
    #[must_use]
    pub fn text(
        stream_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            message_id: MessageId::new(),
            sender_id: sender_id.into(),
            text: text.into(),
            moderation_status: ModerationStatus::Approved,
            message_type: MessageType::Text,
            created_at: Utc::now().trunc_subsecs(6),
        }
    }

    /// Same message with an explicit timestamp.
    #[must_use]
    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at.trunc_subsecs(6);
        self
    }

    /// Same message with an explicit id.
    #[must_use]
    pub fn with_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    /// Reject empty or oversized text and a missing stream id.
    ///
    /// # Errors
    ///
    /// `InvalidMessage` describing the first failed check.
    pub fn validate(&self) -> Result<(), ChatStoreError> {
        if self.stream_id.is_empty() {
            return Err(ChatStoreError::InvalidMessage(
                "stream_id is empty".to_string(),
            ));
        }
        if self.text.trim().is_empty() {
            return Err(ChatStoreError::InvalidMessage("text is empty".to_string()));
        }
        let length = self.text.chars().count();
        if length > MAX_MESSAGE_LENGTH {
            return Err(ChatStoreError::InvalidMessage(format!(
                "text is {length} characters, limit is {MAX_MESSAGE_LENGTH}"
            )));
        }
        Ok(())
    }

    /// Stored form written at `written_at`, expiring one TTL later.
    ///
    /// Expiry runs from the write, not from the caller-supplied
    /// `created_at`, so a backdated message still lives a full TTL.
    #[must_use]
    pub fn into_stored(self, written_at: DateTime<Utc>) -> ChatMessage {
        let expires_at = written_at.trunc_subsecs(6) + ttl();
        ChatMessage {
            stream_id: self.stream_id,
            message_id: self.message_id,
            sender_id: self.sender_id,
            text: self.text,
            moderation_status: self.moderation_status,
            message_type: self.message_type,
            created_at: self.created_at,
            expires_at,
        }
    }
}

fn ttl() -> chrono::Duration {
    chrono::Duration::from_std(CHAT_MESSAGE_TTL).unwrap_or(chrono::Duration::days(30))
}

/// A stored chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub stream_id: String,
    pub message_id: MessageId,
    pub sender_id: String,
    pub text: String,
    pub moderation_status: ModerationStatus,
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Cursor that resumes directly after this message.
    #[must_use]
    pub fn cursor(&self) -> ChatCursor {
        ChatCursor {
            timestamp: self.created_at,
            message_id: Some(self.message_id),
        }
    }

    /// Whether `other` carries the same content, ignoring expiry.
    #[must_use]
    pub fn same_content(&self, other: &NewChatMessage) -> bool {
        self.stream_id == other.stream_id
            && self.message_id == other.message_id
            && self.created_at == other.created_at
            && self.sender_id == other.sender_id
            && self.text == other.text
            && self.moderation_status == other.moderation_status
            && self.message_type == other.message_type
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Position in a stream's newest-first history.
///
/// Without a `message_id` the next page holds messages strictly older than
/// `timestamp`. With one, it resumes exactly after that key, so messages
/// sharing a timestamp across a page boundary are neither skipped nor
/// repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCursor {
    pub timestamp: DateTime<Utc>,
    pub message_id: Option<MessageId>,
}

impl ChatCursor {
    #[must_use]
    pub fn before(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            message_id: None,
        }
    }
}

impl fmt::Display for ChatCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message_id {
            Some(id) => write!(f, "{}/{}", self.timestamp.to_rfc3339(), id),
            None => f.write_str(&self.timestamp.to_rfc3339()),
        }
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPage {
    pub messages: Vec<ChatMessage>,
    /// Set when the page was full; pass back to continue.
    pub next_cursor: Option<ChatCursor>,
}

impl ChatPage {
    pub(crate) fn from_messages(messages: Vec<ChatMessage>, limit: usize) -> Self {
        let next_cursor = if limit > 0 && messages.len() == limit {
            messages.last().map(ChatMessage::cursor)
        } else {
            None
        };
        Self {
            messages,
            next_cursor,
        }
    }
}

/// Clamp a requested page size to `MAX_PAGE_SIZE`.
#[must_use]
pub fn effective_limit(requested: usize) -> usize {
    requested.min(MAX_PAGE_SIZE)
}
