//! Coordinator metrics.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sc_` prefix for the stream controller
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code: `status` (success/error code), `action`
//! (join/leave), `outcome` (applied/duplicate/stale), `stage` (ledger/bus).
//! Stream, viewer and server ids are never labels.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an SFU selection.
///
/// Metric: `sc_sfu_selections_total`, `sc_sfu_selection_duration_seconds`
/// Labels: `status`
pub fn record_sfu_selection(status: &str, duration: Duration) {
    histogram!("sc_sfu_selection_duration_seconds",
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sc_sfu_selections_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a viewer event applied to local membership.
///
/// Metric: `sc_viewer_events_total`
/// Labels: `action`, `outcome`
pub fn record_viewer_event(action: &str, outcome: &str) {
    counter!("sc_viewer_events_total",
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a failed publish; the connect proceeds regardless.
///
/// Metric: `sc_viewer_event_publish_failures_total`
/// Labels: `stage`, `error_type`
pub fn record_publish_failure(stage: &str, error_type: &str) {
    counter!("sc_viewer_event_publish_failures_total",
        "stage" => stage.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a membership resync for one stream.
///
/// Metric: `sc_viewer_resyncs_total`, `sc_viewer_resync_corrections`
/// Labels: `status`
pub fn record_viewer_resync(status: &str, corrections: u64) {
    counter!("sc_viewer_resyncs_total",
        "status" => status.to_string()
    )
    .increment(1);

    #[allow(clippy::cast_precision_loss)]
    let corrections = corrections as f64;
    histogram!("sc_viewer_resync_corrections").record(corrections);
}

/// Record instances newly marked unhealthy by the health checker.
///
/// Metric: `sc_sfu_marked_unhealthy_total`
pub fn record_sfu_marked_unhealthy(count: u64) {
    counter!("sc_sfu_marked_unhealthy_total").increment(count);
}

/// Publish the current instance population.
///
/// Metric: `sc_sfu_instances`
/// Labels: `state` (healthy/unhealthy)
pub fn set_sfu_instances(healthy: usize, unhealthy: usize) {
    #[allow(clippy::cast_precision_loss)]
    let (healthy, unhealthy) = (healthy as f64, unhealthy as f64);
    gauge!("sc_sfu_instances", "state" => "healthy").set(healthy);
    gauge!("sc_sfu_instances", "state" => "unhealthy").set(unhealthy);
}
