//! Where SFU instances announce themselves.
//!
//! Each instance periodically writes an [`SfuAnnouncement`] (its capacity
//! and a wall-clock heartbeat) to a shared directory. Every replica polls
//! the directory and folds fresh announcements into its own registry, so
//! registration and heartbeats reach all replicas without a direct call.

mod memory;
mod redis_directory;

pub use self::memory::{InMemorySfuDirectory, StaticSfuDirectory};
pub use self::redis_directory::{RedisSfuDirectory, SFU_DIRECTORY_KEY};

use crate::errors::CoordinatorError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One instance's latest self-report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuAnnouncement {
    pub server_id: String,
    pub capacity: u32,
    /// Wall-clock millis of the instance's last heartbeat.
    pub heartbeat_at_ms: i64,
}

impl SfuAnnouncement {
    /// Announcement stamped with the current wall-clock time.
    #[must_use]
    pub fn now(server_id: &str, capacity: u32) -> Self {
        Self {
            server_id: server_id.to_string(),
            capacity,
            heartbeat_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Millis since the heartbeat, clamped at zero for clock skew.
    #[must_use]
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.heartbeat_at_ms).max(0)
    }
}

/// Read side of the SFU directory.
#[async_trait]
pub trait SfuDirectory: Send + Sync {
    /// Latest announcement of every instance the directory holds.
    async fn announcements(&self) -> Result<Vec<SfuAnnouncement>, CoordinatorError>;
}

/// Parse `sfu-a=100,sfu-b=250` into `(server_id, capacity)` pairs.
///
/// # Errors
///
/// `CoordinatorError::InvalidCapacity` for a zero capacity, and
/// `CoordinatorError::Serialization` for a malformed entry.
pub fn parse_static_instances(raw: &str) -> Result<Vec<(String, u32)>, CoordinatorError> {
    let mut instances = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((server_id, capacity)) = entry.split_once('=') else {
            return Err(CoordinatorError::Serialization(format!(
                "SFU entry must be id=capacity, got '{entry}'"
            )));
        };
        let server_id = server_id.trim();
        if server_id.is_empty() {
            return Err(CoordinatorError::Serialization(format!(
                "SFU entry has an empty id: '{entry}'"
            )));
        }
        let capacity: u32 = capacity.trim().parse().map_err(|e| {
            CoordinatorError::Serialization(format!("Invalid capacity in '{entry}': {e}"))
        })?;
        if capacity == 0 {
            return Err(CoordinatorError::InvalidCapacity {
                server_id: server_id.to_string(),
                capacity,
            });
        }
        instances.push((server_id.to_string(), capacity));
    }

    Ok(instances)
}
