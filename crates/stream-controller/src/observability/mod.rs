//! Health endpoints and service-level metrics.

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
