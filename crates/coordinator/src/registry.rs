//! SFU instance registry.
//!
//! Instances are stored in a [`DashMap`] keyed by `server_id`; each entry is
//! an `Arc<SfuInstance>` whose counters are atomics. Joins and leaves on one
//! server never contend with another server, and the map shard lock is only
//! held long enough to clone the `Arc`.
//!
//! Selection takes a [`SlotReservation`] on the chosen instance before
//! returning. The reservation counts against capacity until the viewer's
//! join is applied to `current_load` and the guard is dropped, so concurrent
//! selections on one replica can never hand out the same last slot.
//!
//! Instances are never removed. Heartbeat silence or an explicit unhealthy
//! mark only excludes an instance from selection; re-registration or the next
//! heartbeat brings it back under the same identity.

use crate::errors::CoordinatorError;
use crate::selection::SfuCandidate;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Default heartbeat silence before an instance is considered unhealthy.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(15);

/// A registered SFU instance.
#[derive(Debug)]
pub struct SfuInstance {
    server_id: String,
    capacity: AtomicU32,
    current_load: AtomicU32,
    /// Slots held by selections whose join is not applied yet.
    reserved: AtomicU32,
    /// Milliseconds since the registry epoch.
    last_heartbeat_ms: AtomicU64,
    unhealthy: AtomicBool,
}

impl SfuInstance {
    fn new(server_id: &str, capacity: u32, now_ms: u64) -> Self {
        Self {
            server_id: server_id.to_string(),
            capacity: AtomicU32::new(capacity),
            current_load: AtomicU32::new(0),
            reserved: AtomicU32::new(0),
            last_heartbeat_ms: AtomicU64::new(now_ms),
            unhealthy: AtomicBool::new(false),
        }
    }

    /// Instance identifier.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Current viewer count.
    #[must_use]
    pub fn current_load(&self) -> u32 {
        self.current_load.load(Ordering::Acquire)
    }

    /// Maximum viewers.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Slots held by outstanding reservations.
    #[must_use]
    pub fn reserved(&self) -> u32 {
        self.reserved.load(Ordering::Acquire)
    }

    /// Take one slot if `current_load + reserved < capacity`.
    ///
    /// The CAS is on `reserved`; a confirmed join raises `current_load`
    /// before its reservation is released, so the sum never under-counts.
    fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                let held = u64::from(self.current_load()) + u64::from(reserved);
                (held < u64::from(self.capacity())).then(|| reserved.saturating_add(1))
            })
            .is_ok()
    }

    fn release_reservation(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                Some(reserved.saturating_sub(1))
            });
    }

    fn increment_load(&self) -> u32 {
        self.current_load.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn decrement_load(&self) -> u32 {
        // Saturating: a leave for a viewer counted before a resync reset
        // must not wrap the counter.
        let previous = self
            .current_load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                Some(load.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn apply_delta(&self, delta: i64) {
        let _ = self
            .current_load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                let next = i64::from(load).saturating_add(delta).max(0);
                Some(u32::try_from(next).unwrap_or(u32::MAX))
            });
    }
}

/// A slot held on an instance between selection and the viewer's join.
///
/// Dropping the guard releases the slot. Keep it alive until the join has
/// been applied locally, or drop it to abandon the connect.
#[derive(Debug)]
pub struct SlotReservation {
    instance: Arc<SfuInstance>,
}

impl SlotReservation {
    /// Instance the slot is held on.
    #[must_use]
    pub fn server_id(&self) -> &str {
        self.instance.server_id()
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.instance.release_reservation();
    }
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfuSnapshot {
    pub server_id: String,
    pub capacity: u32,
    /// Viewers applied from membership.
    pub current_load: u32,
    /// Slots held by in-flight selections.
    pub reserved: u32,
    pub healthy: bool,
    pub since_heartbeat: Duration,
}

impl SfuSnapshot {
    /// Load selection compares: applied viewers plus held slots.
    #[must_use]
    pub fn effective_load(&self) -> u32 {
        self.current_load.saturating_add(self.reserved)
    }

    /// Whether selection may pick this instance.
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        self.healthy && self.effective_load() < self.capacity
    }
}

/// Registry of SFU instances, constructed once per process and shared by
/// handle.
#[derive(Debug)]
pub struct ServerRegistry {
    epoch: Instant,
    health_timeout: Duration,
    instances: DashMap<String, Arc<SfuInstance>>,
}

impl ServerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(health_timeout: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            health_timeout,
            instances: DashMap::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(Instant::now().duration_since(self.epoch).as_millis()).unwrap_or(u64::MAX)
    }

    fn health_timeout_ms(&self) -> u64 {
        u64::try_from(self.health_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Heartbeat silence tolerated before exclusion.
    #[must_use]
    pub fn health_timeout(&self) -> Duration {
        self.health_timeout
    }

    /// Register or re-register an instance.
    ///
    /// Idempotent upsert: resets capacity, refreshes the heartbeat and clears
    /// the unhealthy mark. Load is left untouched on re-registration since it
    /// is derived from viewer membership. Returns `true` for a new instance.
    ///
    /// # Errors
    ///
    /// `CoordinatorError::InvalidCapacity` if `capacity` is zero.
    pub fn register(&self, server_id: &str, capacity: u32) -> Result<bool, CoordinatorError> {
        if capacity == 0 {
            return Err(CoordinatorError::InvalidCapacity {
                server_id: server_id.to_string(),
                capacity,
            });
        }

        let now_ms = self.now_ms();
        let mut created = false;
        let instance = self
            .instances
            .entry(server_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(SfuInstance::new(server_id, capacity, now_ms))
            })
            .clone();

        instance.capacity.store(capacity, Ordering::Release);
        instance.last_heartbeat_ms.store(now_ms, Ordering::Release);
        let was_unhealthy = instance.unhealthy.swap(false, Ordering::AcqRel);

        info!(
            target: "sc.coordinator.registry",
            server_id = %server_id,
            capacity = capacity,
            created = created,
            was_unhealthy = was_unhealthy,
            "SFU instance registered"
        );

        Ok(created)
    }

    /// Refresh an instance's heartbeat and clear any unhealthy mark.
    ///
    /// # Errors
    ///
    /// `CoordinatorError::UnknownServer` if the instance never registered.
    pub fn heartbeat(&self, server_id: &str) -> Result<(), CoordinatorError> {
        let instance = self
            .get(server_id)
            .ok_or_else(|| CoordinatorError::UnknownServer(server_id.to_string()))?;

        instance
            .last_heartbeat_ms
            .store(self.now_ms(), Ordering::Release);
        if instance.unhealthy.swap(false, Ordering::AcqRel) {
            info!(
                target: "sc.coordinator.registry",
                server_id = %server_id,
                "SFU instance recovered on heartbeat"
            );
        }
        Ok(())
    }

    /// Explicitly exclude an instance from selection.
    pub fn mark_unhealthy(&self, server_id: &str) -> bool {
        match self.get(server_id) {
            Some(instance) => !instance.unhealthy.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    /// Flag every instance whose heartbeat is older than the health timeout.
    ///
    /// Returns the ids newly marked.
    pub fn mark_stale_unhealthy(&self) -> Vec<String> {
        let now_ms = self.now_ms();
        let timeout_ms = self.health_timeout_ms();

        self.instances
            .iter()
            .filter_map(|entry| {
                let instance = entry.value();
                let last = instance.last_heartbeat_ms.load(Ordering::Acquire);
                let stale = now_ms.saturating_sub(last) > timeout_ms;
                if stale && !instance.unhealthy.swap(true, Ordering::AcqRel) {
                    Some(instance.server_id.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Hold one slot on an instance if it still has room.
    ///
    /// Returns `None` when the instance is unknown or already full.
    #[must_use]
    pub fn try_reserve(&self, server_id: &str) -> Option<SlotReservation> {
        let instance = self.get(server_id)?;
        instance
            .try_reserve()
            .then_some(SlotReservation { instance })
    }

    /// Add one viewer to an instance's load. Returns the new load, or `None`
    /// if the instance is not registered here yet.
    pub fn increment_load(&self, server_id: &str) -> Option<u32> {
        let load = self.get(server_id)?.increment_load();
        debug!(
            target: "sc.coordinator.registry",
            server_id = %server_id,
            current_load = load,
            "Load incremented"
        );
        Some(load)
    }

    /// Remove one viewer from an instance's load.
    pub fn decrement_load(&self, server_id: &str) -> Option<u32> {
        let load = self.get(server_id)?.decrement_load();
        debug!(
            target: "sc.coordinator.registry",
            server_id = %server_id,
            current_load = load,
            "Load decremented"
        );
        Some(load)
    }

    /// Apply a signed correction computed by a resync.
    pub fn apply_load_delta(&self, server_id: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(instance) = self.get(server_id) {
            instance.apply_delta(delta);
        }
    }

    /// Overwrite an instance's load.
    pub fn set_load(&self, server_id: &str, load: u32) {
        if let Some(instance) = self.get(server_id) {
            instance.current_load.store(load, Ordering::Release);
        }
    }

    /// Look up an instance handle.
    #[must_use]
    pub fn get(&self, server_id: &str) -> Option<Arc<SfuInstance>> {
        self.instances.get(server_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of one instance.
    #[must_use]
    pub fn snapshot_of(&self, server_id: &str) -> Option<SfuSnapshot> {
        let instance = self.get(server_id)?;
        Some(self.snapshot_instance(&instance, self.now_ms()))
    }

    /// Snapshot of every instance, sorted by `server_id`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SfuSnapshot> {
        let now_ms = self.now_ms();
        let mut snapshots: Vec<SfuSnapshot> = self
            .instances
            .iter()
            .map(|entry| self.snapshot_instance(entry.value(), now_ms))
            .collect();
        snapshots.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        snapshots
    }

    /// Instances currently eligible for selection.
    #[must_use]
    pub fn candidates(&self) -> Vec<SfuCandidate> {
        self.snapshot()
            .into_iter()
            .filter(SfuSnapshot::is_selectable)
            .map(|s| SfuCandidate {
                current_load: s.effective_load(),
                server_id: s.server_id,
                capacity: s.capacity,
            })
            .collect()
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance has registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn snapshot_instance(&self, instance: &SfuInstance, now_ms: u64) -> SfuSnapshot {
        let last = instance.last_heartbeat_ms.load(Ordering::Acquire);
        let since_ms = now_ms.saturating_sub(last);
        let healthy =
            !instance.unhealthy.load(Ordering::Acquire) && since_ms <= self.health_timeout_ms();

        SfuSnapshot {
            server_id: instance.server_id.clone(),
            capacity: instance.capacity(),
            current_load: instance.current_load(),
            reserved: instance.reserved(),
            healthy,
            since_heartbeat: Duration::from_millis(since_ms),
        }
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TIMEOUT)
    }
}
