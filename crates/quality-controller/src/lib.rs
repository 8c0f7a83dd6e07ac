//! Adaptive bitrate control for live-stream viewers.
//!
//! # Components
//!
//! - [`estimator`]: EWMA bandwidth estimation with congestion penalties
//! - [`selection`]: target layer for a bandwidth, with an upgrade margin
//! - [`hysteresis`]: minimum hold times between layer changes
//! - [`controller`]: per-viewer state combining the three
//! - [`viewer_loop`]: one task per viewer feeding stats through the
//!   controller and dispatching layer switches without blocking sampling

pub mod controller;
pub mod dispatcher;
pub mod errors;
pub mod estimator;
pub mod hysteresis;
pub mod layers;
pub mod metrics;
pub mod selection;
pub mod stats;
pub mod viewer_loop;

pub use controller::{QualityDecision, ViewerQualityState};
pub use dispatcher::{ChannelDispatcher, LayerSwitch, LayerSwitchDispatcher, RetryPolicy};
pub use errors::QualityError;
pub use estimator::{estimate_bandwidth, BandwidthEstimate, EstimatorConfig};
pub use hysteresis::{apply_hysteresis, HysteresisDecision, HysteresisReason};
pub use layers::QualityLayer;
pub use selection::{select_quality_layer, DecisionReason, LayerDecision};
pub use stats::TransportStats;
pub use viewer_loop::{QualityLoopConfig, ViewerLoopHandle, ViewerQualitySnapshot};
