//! Authoritative viewer membership used by resync.
//!
//! The replica that handles a connect or disconnect records it here as well
//! as publishing it. Writes are conditional on `occurred_at_ms`, so a leave
//! handled on one replica cannot erase a newer join handled on another.

mod lua_scripts;
mod redis_ledger;

pub use self::redis_ledger::RedisMembershipLedger;

use crate::errors::CoordinatorError;
use crate::events::ViewerEvent;
use crate::membership::MemberRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;

/// Source of truth for stream membership.
#[async_trait]
pub trait MembershipLedger: Send + Sync {
    /// Record a join unless a newer entry exists for the viewer.
    async fn record_join(&self, event: &ViewerEvent) -> Result<(), CoordinatorError>;

    /// Remove a viewer unless its entry is newer than the leave.
    async fn record_leave(&self, event: &ViewerEvent) -> Result<(), CoordinatorError>;

    /// Every present viewer of a stream.
    async fn members(&self, stream_id: &str) -> Result<Vec<MemberRecord>, CoordinatorError>;

    /// Streams with at least one present viewer.
    async fn streams(&self) -> Result<Vec<String>, CoordinatorError>;
}

/// Process-local [`MembershipLedger`] for single-replica deployments and
/// tests.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    streams: DashMap<String, HashMap<String, (String, i64)>>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipLedger for InMemoryLedger {
    async fn record_join(&self, event: &ViewerEvent) -> Result<(), CoordinatorError> {
        let mut members = self.streams.entry(event.stream_id.clone()).or_default();
        let newer_exists = members
            .get(&event.viewer_id)
            .is_some_and(|(_, at)| *at > event.occurred_at_ms);
        if !newer_exists {
            members.insert(
                event.viewer_id.clone(),
                (event.server_id.clone(), event.occurred_at_ms),
            );
        }
        Ok(())
    }

    async fn record_leave(&self, event: &ViewerEvent) -> Result<(), CoordinatorError> {
        if let Some(mut members) = self.streams.get_mut(&event.stream_id) {
            let newer_exists = members
                .get(&event.viewer_id)
                .is_some_and(|(_, at)| *at > event.occurred_at_ms);
            if !newer_exists {
                members.remove(&event.viewer_id);
            }
        }
        self.streams
            .remove_if(&event.stream_id, |_, members| members.is_empty());
        Ok(())
    }

    async fn members(&self, stream_id: &str) -> Result<Vec<MemberRecord>, CoordinatorError> {
        let records = self
            .streams
            .get(stream_id)
            .map(|members| {
                members
                    .iter()
                    .map(|(viewer_id, (server_id, at))| MemberRecord {
                        viewer_id: viewer_id.clone(),
                        server_id: server_id.clone(),
                        occurred_at_ms: *at,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(records)
    }

    async fn streams(&self) -> Result<Vec<String>, CoordinatorError> {
        Ok(self
            .streams
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// Encode a ledger hash value as `<occurred_at_ms>:<server_id>`.
pub(crate) fn encode_entry(server_id: &str, occurred_at_ms: i64) -> String {
    format!("{occurred_at_ms}:{server_id}")
}

/// Decode a ledger hash value written by [`encode_entry`].
pub(crate) fn decode_entry(raw: &str) -> Option<(String, i64)> {
    let (at, server_id) = raw.split_once(':')?;
    let at = at.parse().ok()?;
    Some((server_id.to_string(), at))
}
