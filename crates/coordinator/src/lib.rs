//! SFU coordinator.
//!
//! Tracks media-server (SFU) instances, picks the least-loaded healthy
//! instance for a new viewer, and keeps per-server viewer counts in sync
//! across independent replicas through a pub/sub [`bus::ViewerEventBus`].
//!
//! Membership is tracked as per-stream sets keyed by viewer id, so duplicate
//! or reordered bus deliveries converge to the same counts. A periodic
//! resync against a [`ledger::MembershipLedger`] corrects drift from lost
//! messages. SFU instances reach every replica's registry through a shared
//! [`directory::SfuDirectory`].

pub mod bus;
pub mod coordinator;
pub mod directory;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod membership;
pub mod metrics;
pub mod registry;
pub mod selection;
pub mod tasks;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use errors::CoordinatorError;
pub use events::{ViewerAction, ViewerEvent};
pub use registry::{ServerRegistry, SfuSnapshot, SlotReservation};
