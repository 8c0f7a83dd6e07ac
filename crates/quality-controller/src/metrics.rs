//! Quality controller metrics.
//!
//! Names use the `sc_quality_` prefix. Labels are bounded by code:
//! `outcome` (switched plus hysteresis reasons), `status`, `direction`.
//! Viewer and stream ids are never labels.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one stats report folded into a viewer's state.
///
/// Metric: `sc_quality_decisions_total`
/// Labels: `outcome`
pub fn record_quality_decision(outcome: &str) {
    counter!("sc_quality_decisions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the result of dispatching a layer switch.
///
/// Metric: `sc_quality_layer_switches_total`, `sc_quality_layer_switch_duration_seconds`
/// Labels: `status` (success/error code/superseded)
pub fn record_layer_switch(status: &str, attempts: u32, duration: Duration) {
    counter!("sc_quality_layer_switches_total",
        "status" => status.to_string()
    )
    .increment(1);

    histogram!("sc_quality_layer_switch_duration_seconds",
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    histogram!("sc_quality_layer_switch_attempts").record(f64::from(attempts));
}

/// Record a stats report dropped because the viewer loop was saturated.
///
/// Metric: `sc_quality_stats_dropped_total`
pub fn record_stats_dropped() {
    counter!("sc_quality_stats_dropped_total").increment(1);
}

/// Record a viewer loop starting or stopping.
///
/// Metric: `sc_quality_active_loops`
pub fn record_loop_started() {
    gauge!("sc_quality_active_loops").increment(1.0);
}

pub fn record_loop_stopped() {
    gauge!("sc_quality_active_loops").decrement(1.0);
}
