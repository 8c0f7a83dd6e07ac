//! Coordinator service.
//!
//! Combines the [`ServerRegistry`], this replica's [`ViewerMembership`], the
//! event bus and the membership ledger. One `Coordinator` is built per
//! process and shared behind an `Arc`.
//!
//! # Flow
//!
//! 1. `select_least_loaded_server` picks an instance and holds a slot on it
//!    (fail fast, no retry).
//! 2. After the viewer connects, `publish_viewer_join` applies the join
//!    locally, records it in the ledger and broadcasts it. The caller then
//!    drops the slot reservation.
//! 3. Every replica's consumer task feeds bus events to `apply_event`.
//! 4. `sync_viewer_count` periodically replaces local membership with the
//!    ledger's and corrects server loads.

use crate::bus::ViewerEventBus;
use crate::errors::CoordinatorError;
use crate::events::{ViewerAction, ViewerEvent};
use crate::ledger::MembershipLedger;
use crate::membership::{MembershipChange, ViewerMembership};
use crate::metrics;
use crate::registry::{ServerRegistry, SfuSnapshot, SlotReservation};
use crate::selection::select_least_loaded;
use common::deadline::Deadline;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Default deadline for selection when the caller has none.
pub const DEFAULT_SELECTION_TIMEOUT: Duration = Duration::from_millis(250);

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identifier of this replica, for logs.
    pub replica_id: String,
}

/// SFU coordinator for one replica.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<ServerRegistry>,
    membership: ViewerMembership,
    bus: Arc<dyn ViewerEventBus>,
    ledger: Arc<dyn MembershipLedger>,
    /// Last `occurred_at_ms` stamped by this replica.
    last_stamp_ms: AtomicI64,
}

impl Coordinator {
    /// Create a coordinator over shared collaborators.
    #[must_use]
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<ServerRegistry>,
        bus: Arc<dyn ViewerEventBus>,
        ledger: Arc<dyn MembershipLedger>,
    ) -> Self {
        Self {
            config,
            registry,
            membership: ViewerMembership::new(),
            bus,
            ledger,
            last_stamp_ms: AtomicI64::new(0),
        }
    }

    /// Wall-clock millis, strictly increasing per replica so a leave and a
    /// rejoin in the same millisecond still order correctly.
    fn next_stamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_stamp_ms
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }

    /// Shared registry handle.
    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Event bus handle.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn ViewerEventBus> {
        &self.bus
    }

    /// Register or re-register an SFU instance.
    ///
    /// A newly seen instance gets its load from viewers this replica already
    /// knows about (events may arrive before the registration does).
    ///
    /// # Errors
    ///
    /// `CoordinatorError::InvalidCapacity` for a zero capacity.
    pub fn register_server(
        &self,
        server_id: &str,
        capacity: u32,
    ) -> Result<(), CoordinatorError> {
        let created = self.registry.register(server_id, capacity)?;
        if created {
            let known = self.membership.count_on_server(server_id);
            if known > 0 {
                self.registry
                    .set_load(server_id, u32::try_from(known).unwrap_or(u32::MAX));
            }
        }
        Ok(())
    }

    /// Refresh an instance's heartbeat.
    ///
    /// # Errors
    ///
    /// `CoordinatorError::UnknownServer` if the instance never registered.
    pub fn record_heartbeat(&self, server_id: &str) -> Result<(), CoordinatorError> {
        self.registry.heartbeat(server_id)
    }

    /// Pick the healthy instance with the lowest load ratio and hold a slot
    /// on it.
    ///
    /// The returned reservation counts against the instance's capacity until
    /// it is dropped. Hold it across [`Coordinator::publish_viewer_join`].
    ///
    /// # Errors
    ///
    /// - `CoordinatorError::NoAvailableServer` - every instance unhealthy or full
    /// - `CoordinatorError::Timeout` - the deadline passed
    #[instrument(skip_all, fields(stream_id = %stream_id))]
    pub async fn select_least_loaded_server(
        &self,
        stream_id: &str,
        deadline: Deadline,
    ) -> Result<SlotReservation, CoordinatorError> {
        let start = Instant::now();

        let result = match deadline.run(async { self.select_now(stream_id) }).await {
            Ok(inner) => inner,
            Err(elapsed) => Err(elapsed.into()),
        };

        let status = match &result {
            Ok(_) => "success",
            Err(e) => e.error_code(),
        };
        metrics::record_sfu_selection(status, start.elapsed());

        result
    }

    fn select_now(&self, stream_id: &str) -> Result<SlotReservation, CoordinatorError> {
        // A lost reservation race means the picked instance just filled up,
        // so each retry sees one fewer candidate.
        for _ in 0..=self.registry.len() {
            let candidates = self.registry.candidates();
            let Some(selected) = select_least_loaded(&candidates) else {
                break;
            };

            if let Some(reservation) = self.registry.try_reserve(&selected.server_id) {
                debug!(
                    target: "sc.coordinator.selection",
                    stream_id = %stream_id,
                    server_id = %selected.server_id,
                    load_ratio = selected.load_ratio(),
                    candidate_count = candidates.len(),
                    "Selected SFU instance"
                );
                return Ok(reservation);
            }

            debug!(
                target: "sc.coordinator.selection",
                stream_id = %stream_id,
                server_id = %selected.server_id,
                "Selected instance filled concurrently, reselecting"
            );
        }

        warn!(
            target: "sc.coordinator.selection",
            stream_id = %stream_id,
            registered = self.registry.len(),
            "No SFU instance available for selection"
        );
        Err(CoordinatorError::NoAvailableServer)
    }

    /// Announce that a viewer connected to `server_id`.
    ///
    /// The join is applied locally first, so this replica's next selection
    /// already sees the new load. Ledger and bus failures are logged and
    /// returned; the caller must not fail the viewer connect on them.
    ///
    /// # Errors
    ///
    /// The first ledger/bus failure, or `CoordinatorError::Timeout`.
    #[instrument(skip_all, fields(stream_id = %stream_id, viewer_id = %viewer_id, server_id = %server_id))]
    pub async fn publish_viewer_join(
        &self,
        stream_id: &str,
        viewer_id: &str,
        server_id: &str,
        deadline: Deadline,
    ) -> Result<(), CoordinatorError> {
        let mut event = ViewerEvent::join(stream_id, viewer_id, server_id);
        event.occurred_at_ms = self.next_stamp();
        self.publish(event, deadline).await
    }

    /// Announce that a viewer disconnected.
    ///
    /// # Errors
    ///
    /// Same as [`Coordinator::publish_viewer_join`].
    #[instrument(skip_all, fields(stream_id = %stream_id, viewer_id = %viewer_id, server_id = %server_id))]
    pub async fn publish_viewer_leave(
        &self,
        stream_id: &str,
        viewer_id: &str,
        server_id: &str,
        deadline: Deadline,
    ) -> Result<(), CoordinatorError> {
        let mut event = ViewerEvent::leave(stream_id, viewer_id, server_id);
        event.occurred_at_ms = self.next_stamp();
        self.publish(event, deadline).await
    }

    async fn publish(
        &self,
        event: ViewerEvent,
        deadline: Deadline,
    ) -> Result<(), CoordinatorError> {
        self.apply_event(&event);

        let ledger_write = async {
            match event.action {
                ViewerAction::Join => self.ledger.record_join(&event).await,
                ViewerAction::Leave => self.ledger.record_leave(&event).await,
            }
        };
        let ledger_result = match deadline.run(ledger_write).await {
            Ok(inner) => inner,
            Err(elapsed) => Err(elapsed.into()),
        };
        if let Err(e) = &ledger_result {
            warn!(
                target: "sc.coordinator.bus",
                error = %e,
                action = event.action.as_str(),
                "Failed to record viewer event in ledger, resync will repair"
            );
            metrics::record_publish_failure("ledger", e.error_code());
        }

        let topic = event.topic();
        let bus_result = match deadline.run(self.bus.publish(&topic, &event)).await {
            Ok(inner) => inner,
            Err(elapsed) => Err(elapsed.into()),
        };
        if let Err(e) = &bus_result {
            warn!(
                target: "sc.coordinator.bus",
                error = %e,
                topic = %topic,
                action = event.action.as_str(),
                "Failed to publish viewer event, other replicas converge on resync"
            );
            metrics::record_publish_failure("bus", e.error_code());
        }

        ledger_result.and(bus_result)
    }

    /// Apply a viewer event to local membership and server loads.
    ///
    /// Idempotent and order-insensitive; duplicates and stale events are
    /// dropped silently.
    pub fn apply_event(&self, event: &ViewerEvent) -> MembershipChange {
        let change = self.membership.apply(event);

        match &change {
            MembershipChange::Joined { server_id } => {
                self.registry.increment_load(server_id);
            }
            MembershipChange::Left { server_id } => {
                self.registry.decrement_load(server_id);
            }
            MembershipChange::Moved { from, to } => {
                self.registry.decrement_load(from);
                self.registry.increment_load(to);
            }
            MembershipChange::Duplicate | MembershipChange::Stale => {
                debug!(
                    target: "sc.coordinator.membership",
                    stream_id = %event.stream_id,
                    viewer_id = %event.viewer_id,
                    outcome = change.outcome(),
                    "Viewer event deduplicated"
                );
            }
        }

        metrics::record_viewer_event(event.action.as_str(), change.outcome());
        change
    }

    /// Recount a stream from the ledger and overwrite the local view.
    ///
    /// The ledger read is stamped before it starts; local entries newer than
    /// that stamp survive the merge, and older events for viewers without a
    /// local entry are treated as already reflected. Returns the merged
    /// viewer count.
    ///
    /// # Errors
    ///
    /// Ledger failures, or `CoordinatorError::Timeout`.
    #[instrument(skip_all, fields(stream_id = %stream_id))]
    pub async fn sync_viewer_count(
        &self,
        stream_id: &str,
        deadline: Deadline,
    ) -> Result<usize, CoordinatorError> {
        let synced_through_ms = self.next_stamp();
        let records = match deadline.run(self.ledger.members(stream_id)).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                metrics::record_viewer_resync(e.error_code(), 0);
                return Err(e);
            }
            Err(elapsed) => {
                let e: CoordinatorError = elapsed.into();
                metrics::record_viewer_resync(e.error_code(), 0);
                return Err(e);
            }
        };

        let ledger_count = records.len();
        let previous = self.membership.count(stream_id);
        let deltas = self
            .membership
            .replace_stream(stream_id, records, synced_through_ms);
        let count = self.membership.count(stream_id);

        let mut corrections = 0u64;
        for (server_id, delta) in &deltas {
            self.registry.apply_load_delta(server_id, *delta);
            corrections += delta.unsigned_abs();
        }

        if corrections > 0 {
            info!(
                target: "sc.coordinator.membership",
                stream_id = %stream_id,
                previous = previous,
                ledger_count = ledger_count,
                count = count,
                corrections = corrections,
                "Viewer membership corrected by resync"
            );
        }
        metrics::record_viewer_resync("success", corrections);

        Ok(count)
    }

    /// Locally cached viewer count for a stream.
    #[must_use]
    pub fn viewer_count(&self, stream_id: &str) -> usize {
        self.membership.count(stream_id)
    }

    /// Server a viewer is assigned to, as seen by this replica.
    #[must_use]
    pub fn assignment(&self, stream_id: &str, viewer_id: &str) -> Option<String> {
        self.membership.assignment(stream_id, viewer_id)
    }

    /// Streams this replica has membership for.
    #[must_use]
    pub fn known_streams(&self) -> Vec<String> {
        self.membership.stream_ids()
    }

    /// Streams to resync: those known locally plus every stream the ledger
    /// holds viewers for, sorted.
    ///
    /// # Errors
    ///
    /// Ledger failures, or `CoordinatorError::Timeout`.
    pub async fn resync_targets(&self, deadline: Deadline) -> Result<Vec<String>, CoordinatorError> {
        let from_ledger = match deadline.run(self.ledger.streams()).await {
            Ok(inner) => inner?,
            Err(elapsed) => return Err(elapsed.into()),
        };

        let mut streams = self.known_streams();
        streams.extend(from_ledger);
        streams.sort();
        streams.dedup();
        Ok(streams)
    }

    /// Snapshot of every registered instance.
    #[must_use]
    pub fn servers(&self) -> Vec<SfuSnapshot> {
        self.registry.snapshot()
    }

    /// Replica identifier.
    #[must_use]
    pub fn replica_id(&self) -> &str {
        &self.config.replica_id
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("replica_id", &self.config.replica_id)
            .field("servers", &self.registry.len())
            .finish_non_exhaustive()
    }
}
