//! Redis hash membership ledger.
//!
//! # Key Patterns
//!
//! - `stream:{id}:viewers` - HASH of `viewer_id -> <occurred_at_ms>:<server_id>`,
//!   expiring after [`MEMBERSHIP_IDLE_TTL`] without a join

use super::lua_scripts;
use super::{decode_entry, encode_entry, MembershipLedger};
use crate::errors::CoordinatorError;
use crate::events::ViewerEvent;
use crate::membership::MemberRecord;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Expiry of a membership hash that sees no joins.
pub const MEMBERSHIP_IDLE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const MEMBERS_KEY_PATTERN: &str = "stream:*:viewers";

fn members_key(stream_id: &str) -> String {
    format!("stream:{stream_id}:viewers")
}

fn stream_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix("stream:")?.strip_suffix(":viewers")
}

/// Redis-backed [`MembershipLedger`].
///
/// Cheap to clone; the `MultiplexedConnection` is cloned per operation.
#[derive(Clone)]
pub struct RedisMembershipLedger {
    connection: MultiplexedConnection,
    record_join_script: Script,
    record_leave_script: Script,
}

impl RedisMembershipLedger {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `CoordinatorError::Redis` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CoordinatorError> {
        let client = Client::open(redis_url).map_err(|e| {
            error!(
                target: "sc.coordinator.ledger",
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
                    target: "sc.coordinator.ledger",
                    error = %e,
                    "Failed to connect to Redis"
                );
                CoordinatorError::Redis(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            record_join_script: Script::new(lua_scripts::RECORD_JOIN),
            record_leave_script: Script::new(lua_scripts::RECORD_LEAVE),
        })
    }
}

#[async_trait]
impl MembershipLedger for RedisMembershipLedger {
    #[instrument(skip_all, fields(stream_id = %event.stream_id, viewer_id = %event.viewer_id))]
    async fn record_join(&self, event: &ViewerEvent) -> Result<(), CoordinatorError> {
        let mut conn = self.connection.clone();

        let written: i64 = self
            .record_join_script
            .key(members_key(&event.stream_id))
            .arg(&event.viewer_id)
            .arg(event.occurred_at_ms)
            .arg(encode_entry(&event.server_id, event.occurred_at_ms))
            .arg(u64::try_from(MEMBERSHIP_IDLE_TTL.as_millis()).unwrap_or(u64::MAX))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "sc.coordinator.ledger",
                    error = %e,
                    "Failed to record join"
                );
                CoordinatorError::Redis(format!("Failed to record join: {e}"))
            })?;

        debug!(
            target: "sc.coordinator.ledger",
            written = written == 1,
            "Recorded join"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(stream_id = %event.stream_id, viewer_id = %event.viewer_id))]
    async fn record_leave(&self, event: &ViewerEvent) -> Result<(), CoordinatorError> {
        let mut conn = self.connection.clone();

        let removed: i64 = self
            .record_leave_script
            .key(members_key(&event.stream_id))
            .arg(&event.viewer_id)
            .arg(event.occurred_at_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(
                    target: "sc.coordinator.ledger",
                    error = %e,
                    "Failed to record leave"
                );
                CoordinatorError::Redis(format!("Failed to record leave: {e}"))
            })?;

        debug!(
            target: "sc.coordinator.ledger",
            removed = removed == 1,
            "Recorded leave"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(stream_id = %stream_id))]
    async fn members(&self, stream_id: &str) -> Result<Vec<MemberRecord>, CoordinatorError> {
        let mut conn = self.connection.clone();

        let raw: HashMap<String, String> =
            conn.hgetall(members_key(stream_id)).await.map_err(|e| {
                warn!(
                    target: "sc.coordinator.ledger",
                    error = %e,
                    "Failed to read membership"
                );
                CoordinatorError::Redis(format!("Failed to read membership: {e}"))
            })?;

        let records = raw
            .into_iter()
            .filter_map(|(viewer_id, value)| match decode_entry(&value) {
                Some((server_id, occurred_at_ms)) => Some(MemberRecord {
                    viewer_id,
                    server_id,
                    occurred_at_ms,
                }),
                None => {
                    warn!(
                        target: "sc.coordinator.ledger",
                        viewer_id = %viewer_id,
                        "Skipping malformed membership entry"
                    );
                    None
                }
            })
            .collect();

        Ok(records)
    }

    #[instrument(skip_all)]
    async fn streams(&self) -> Result<Vec<String>, CoordinatorError> {
        let mut conn = self.connection.clone();

        let mut keys = conn
            .scan_match::<_, String>(MEMBERS_KEY_PATTERN)
            .await
            .map_err(|e| {
                warn!(
                    target: "sc.coordinator.ledger",
                    error = %e,
                    "Failed to scan membership keys"
                );
                CoordinatorError::Redis(format!("Failed to scan membership keys: {e}"))
            })?;

        let mut streams = Vec::new();
        while let Some(key) = keys.next_item().await {
            if let Some(stream_id) = stream_id_from_key(&key) {
                streams.push(stream_id.to_string());
            }
        }
        streams.sort();
        streams.dedup();
        Ok(streams)
    }
}
