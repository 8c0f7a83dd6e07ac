//! Per-replica viewer membership sets.
//!
//! Each stream maps `viewer_id` to the last event seen for that viewer.
//! Applying an event is idempotent and order-insensitive:
//!
//! - an event older than the stored one is stale and ignored
//! - a leave keeps a tombstone so a late, older join cannot resurrect it
//! - at equal timestamps a leave wins over a join
//!
//! A resync records a per-stream floor: the ledger already reflects every
//! event stamped at or before it. An event at or below the floor for a
//! viewer with no local entry is stale, so a redelivered join cannot
//! resurrect a viewer whose tombstone the resync pruned. Tombstones above
//! the floor survive the resync. A stream left with no entries is dropped,
//! and its floor is kept as the replica-wide floor for streams without
//! local state.
//!
//! Load counters are only touched when presence actually changes, which the
//! caller learns from the returned [`MembershipChange`].

use crate::events::{ViewerAction, ViewerEvent};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
struct MemberEntry {
    server_id: String,
    present: bool,
    occurred_at_ms: i64,
}

/// Effect of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// Viewer became present on a server.
    Joined { server_id: String },
    /// Viewer is no longer present.
    Left { server_id: String },
    /// Viewer switched servers within the stream.
    Moved { from: String, to: String },
    /// Already reflected; nothing changed.
    Duplicate,
    /// Older than what is already recorded; ignored.
    Stale,
}

impl MembershipChange {
    /// Metric label for the outcome.
    #[must_use]
    pub fn outcome(&self) -> &'static str {
        match self {
            MembershipChange::Joined { .. }
            | MembershipChange::Left { .. }
            | MembershipChange::Moved { .. } => "applied",
            MembershipChange::Duplicate => "duplicate",
            MembershipChange::Stale => "stale",
        }
    }
}

/// Authoritative membership row used by a resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub viewer_id: String,
    pub server_id: String,
    pub occurred_at_ms: i64,
}

#[derive(Debug, Default)]
struct StreamMembers {
    members: HashMap<String, MemberEntry>,
    /// Events at or below this stamp are already reflected in the ledger.
    synced_through_ms: i64,
}

impl StreamMembers {
    fn with_floor(synced_through_ms: i64) -> Self {
        Self {
            members: HashMap::new(),
            synced_through_ms,
        }
    }

    fn present_per_server(&self) -> HashMap<String, i64> {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for entry in self.members.values().filter(|e| e.present) {
            *counts.entry(entry.server_id.clone()).or_default() += 1;
        }
        counts
    }
}

/// Viewer membership for every stream this replica has seen.
#[derive(Debug, Default)]
pub struct ViewerMembership {
    streams: DashMap<String, StreamMembers>,
    /// Highest floor of any stream dropped after a resync.
    retired_floor_ms: AtomicI64,
}

impl ViewerMembership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a join or leave.
    pub fn apply(&self, event: &ViewerEvent) -> MembershipChange {
        let retired_floor = self.retired_floor_ms.load(Ordering::Acquire);
        let mut stream = self
            .streams
            .entry(event.stream_id.clone())
            .or_insert_with(|| StreamMembers::with_floor(retired_floor));
        let existing = stream.members.get(&event.viewer_id).cloned();

        if existing.is_none() && event.occurred_at_ms <= stream.synced_through_ms {
            if stream.members.is_empty() {
                drop(stream);
                self.streams
                    .remove_if(&event.stream_id, |_, s| s.members.is_empty());
            }
            return MembershipChange::Stale;
        }

        if let Some(current) = &existing {
            if event.occurred_at_ms < current.occurred_at_ms {
                return MembershipChange::Stale;
            }
            if event.occurred_at_ms == current.occurred_at_ms
                && event.action == ViewerAction::Join
                && !current.present
            {
                return MembershipChange::Stale;
            }
        }

        let change = match (event.action, &existing) {
            (ViewerAction::Join, Some(current)) if current.present => {
                if current.server_id == event.server_id {
                    MembershipChange::Duplicate
                } else {
                    MembershipChange::Moved {
                        from: current.server_id.clone(),
                        to: event.server_id.clone(),
                    }
                }
            }
            (ViewerAction::Join, _) => MembershipChange::Joined {
                server_id: event.server_id.clone(),
            },
            (ViewerAction::Leave, Some(current)) if current.present => MembershipChange::Left {
                server_id: current.server_id.clone(),
            },
            (ViewerAction::Leave, _) => MembershipChange::Duplicate,
        };

        stream.members.insert(
            event.viewer_id.clone(),
            MemberEntry {
                server_id: event.server_id.clone(),
                present: event.action == ViewerAction::Join,
                occurred_at_ms: event.occurred_at_ms,
            },
        );

        change
    }

    /// Merge an authoritative ledger read into a stream's membership.
    ///
    /// `synced_through_ms` is the stamp up to which the ledger is known to
    /// be complete. Per viewer the newer of the ledger record and the local
    /// entry wins; local entries missing from the ledger survive only if
    /// they are newer than `synced_through_ms`. Returns the per-server load
    /// corrections (`new - old`) the caller must apply.
    pub fn replace_stream(
        &self,
        stream_id: &str,
        records: Vec<MemberRecord>,
        synced_through_ms: i64,
    ) -> HashMap<String, i64> {
        let retired_floor = self.retired_floor_ms.load(Ordering::Acquire);
        let mut stream = self
            .streams
            .entry(stream_id.to_string())
            .or_insert_with(|| StreamMembers::with_floor(retired_floor));

        let before = stream.present_per_server();

        let mut merged: HashMap<String, MemberEntry> = stream
            .members
            .drain()
            .filter(|(_, entry)| entry.occurred_at_ms > synced_through_ms)
            .collect();
        let mut ledger_wins: HashMap<String, MemberEntry> = HashMap::new();
        for record in records {
            let from_ledger = MemberEntry {
                server_id: record.server_id,
                present: true,
                occurred_at_ms: record.occurred_at_ms,
            };
            match merged.get(&record.viewer_id) {
                Some(local) if local.occurred_at_ms >= from_ledger.occurred_at_ms => {}
                _ => {
                    ledger_wins.insert(record.viewer_id, from_ledger);
                }
            }
        }
        merged.extend(ledger_wins);

        stream.members = merged;
        stream.synced_through_ms = stream.synced_through_ms.max(synced_through_ms);
        let after = stream.present_per_server();

        if stream.members.is_empty() {
            let floor = stream.synced_through_ms;
            drop(stream);
            if self
                .streams
                .remove_if(stream_id, |_, s| s.members.is_empty())
                .is_some()
            {
                self.retired_floor_ms.fetch_max(floor, Ordering::AcqRel);
            }
        }

        let mut deltas: HashMap<String, i64> = HashMap::new();
        for (server_id, count) in before {
            *deltas.entry(server_id).or_default() -= count;
        }
        for (server_id, count) in after {
            *deltas.entry(server_id).or_default() += count;
        }
        deltas.retain(|_, delta| *delta != 0);
        deltas
    }

    /// Present viewers in a stream.
    #[must_use]
    pub fn count(&self, stream_id: &str) -> usize {
        self.streams
            .get(stream_id)
            .map_or(0, |stream| stream.members.values().filter(|e| e.present).count())
    }

    /// Server a viewer is currently assigned to in a stream.
    #[must_use]
    pub fn assignment(&self, stream_id: &str, viewer_id: &str) -> Option<String> {
        self.streams.get(stream_id).and_then(|stream| {
            stream
                .members
                .get(viewer_id)
                .filter(|e| e.present)
                .map(|e| e.server_id.clone())
        })
    }

    /// Present viewers on one server across all streams.
    #[must_use]
    pub fn count_on_server(&self, server_id: &str) -> usize {
        self.streams
            .iter()
            .map(|stream| {
                stream
                    .members
                    .values()
                    .filter(|e| e.present && e.server_id == server_id)
                    .count()
            })
            .sum()
    }

    /// Streams with any local entries.
    #[must_use]
    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
