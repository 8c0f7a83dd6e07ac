//! Stream Controller Service Library
//!
//! The control plane process for live streams. It wires together:
//!
//! - [`coordinator`]: SFU registry, least-loaded selection and cross-replica
//!   viewer counts
//! - [`quality_controller`]: one adaptive bitrate loop per connected viewer
//! - [`chat_store`]: partitioned, TTL-bound chat history
//!
//! and owns what spans them: viewer sessions, stream lifecycle, health and
//! metrics endpoints.
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`controller`] - Library surface for a thin control API
//! - [`errors`] - Error type wrapping component errors
//! - [`lifecycle`] - Live/ended transitions and their broadcast
//! - [`lifecycle_store`] - Lifecycle state shared across replicas
//! - [`observability`] - Health router and service metrics
//! - [`sessions`] - Viewer sessions and their quality loops
//! - [`tasks`] - Lifecycle transition consumer

pub mod config;
pub mod controller;
pub mod errors;
pub mod lifecycle;
pub mod lifecycle_store;
pub mod observability;
pub mod sessions;
pub mod tasks;

pub use controller::{ChatTimeouts, StreamController};
pub use errors::StreamControllerError;
pub use lifecycle::{StreamLifecycle, StreamState, StreamTransition};
pub use lifecycle_store::{InMemoryLifecycleStore, LifecycleStore, RedisLifecycleStore, TransitionOutcome};
pub use sessions::{SessionSettings, ViewerSession, ViewerSessionService, ViewerSessionStatus};
