//! Redis-backed SFU directory.
//!
//! Instances write JSON [`SfuAnnouncement`]s into one hash keyed by server
//! id. Replicas read the whole hash on each poll.

use super::{SfuAnnouncement, SfuDirectory};
use crate::errors::CoordinatorError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tracing::{error, instrument, warn};

/// Hash of `server_id -> announcement JSON`.
pub const SFU_DIRECTORY_KEY: &str = "sfu:instances";

/// Redis-backed [`SfuDirectory`].
#[derive(Clone)]
pub struct RedisSfuDirectory {
    connection: MultiplexedConnection,
}

impl RedisSfuDirectory {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Redis` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CoordinatorError> {
        let client = Client::open(redis_url).map_err(|e| {
            error!(
                target: "sc.coordinator.directory",
                error = %e,
                "Failed to open Redis client"
            );
            CoordinatorError::Redis(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(
                    target: "sc.coordinator.directory",
                    error = %e,
                    "Failed to connect to Redis"
                );
                CoordinatorError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self { connection })
    }

    /// Write an instance's announcement. SFU agents call this on every
    /// heartbeat.
    ///
    /// # Errors
    ///
    /// `CoordinatorError::Redis` if the write fails.
    #[instrument(skip_all, fields(server_id = %announcement.server_id))]
    pub async fn announce(&self, announcement: &SfuAnnouncement) -> Result<(), CoordinatorError> {
        let payload = serde_json::to_string(announcement)?;
        let mut conn = self.connection.clone();

        conn.hset::<_, _, _, ()>(SFU_DIRECTORY_KEY, &announcement.server_id, payload)
            .await
            .map_err(|e| CoordinatorError::Redis(format!("Failed to announce SFU: {e}")))
    }

    /// Remove an instance from the directory.
    ///
    /// # Errors
    ///
    /// `CoordinatorError::Redis` if the delete fails.
    pub async fn withdraw(&self, server_id: &str) -> Result<(), CoordinatorError> {
        let mut conn = self.connection.clone();
        conn.hdel::<_, _, ()>(SFU_DIRECTORY_KEY, server_id)
            .await
            .map_err(|e| CoordinatorError::Redis(format!("Failed to withdraw SFU: {e}")))
    }
}

#[async_trait]
impl SfuDirectory for RedisSfuDirectory {
    #[instrument(skip_all)]
    async fn announcements(&self) -> Result<Vec<SfuAnnouncement>, CoordinatorError> {
        let mut conn = self.connection.clone();

        let raw: HashMap<String, String> = conn.hgetall(SFU_DIRECTORY_KEY).await.map_err(|e| {
            warn!(
                target: "sc.coordinator.directory",
                error = %e,
                "Failed to read SFU directory"
            );
            CoordinatorError::Redis(format!("Failed to read SFU directory: {e}"))
        })?;

        let mut announcements = Vec::with_capacity(raw.len());
        for (server_id, payload) in raw {
            match serde_json::from_str::<SfuAnnouncement>(&payload) {
                Ok(announcement) if announcement.server_id == server_id => {
                    announcements.push(announcement);
                }
                Ok(announcement) => {
                    warn!(
                        target: "sc.coordinator.directory",
                        field = %server_id,
                        announced_id = %announcement.server_id,
                        "Skipping announcement filed under another id"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "sc.coordinator.directory",
                        server_id = %server_id,
                        error = %e,
                        "Skipping malformed SFU announcement"
                    );
                }
            }
        }
        announcements.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        Ok(announcements)
    }
}
