//! Chat store metrics.
//!
//! Labels are bounded by code: `backend` (memory/postgres), `operation`,
//! `status` (success or error code). Stream ids are never labels.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a write attempt.
///
/// Metric: `sc_chat_writes_total`, `sc_chat_write_duration_seconds`
/// Labels: `backend`, `status`
pub fn record_chat_write(backend: &'static str, status: &str, duration: Duration) {
    histogram!("sc_chat_write_duration_seconds",
        "backend" => backend,
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sc_chat_writes_total",
        "backend" => backend,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a read.
///
/// Metric: `sc_chat_reads_total`, `sc_chat_read_duration_seconds`
/// Labels: `backend`, `operation` (list_by_stream/list_range), `status`
pub fn record_chat_read(backend: &'static str, operation: &'static str, status: &str, duration: Duration) {
    histogram!("sc_chat_read_duration_seconds",
        "backend" => backend,
        "operation" => operation
    )
    .record(duration.as_secs_f64());

    counter!("sc_chat_reads_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record messages removed by an expiry sweep.
///
/// Metric: `sc_chat_messages_expired_total`, `sc_chat_expiry_runs_total`
pub fn record_chat_expiry(status: &str, removed: u64) {
    counter!("sc_chat_expiry_runs_total",
        "status" => status.to_string()
    )
    .increment(1);
    counter!("sc_chat_messages_expired_total").increment(removed);
}

/// Publish writes currently holding an admission permit.
///
/// Metric: `sc_chat_inflight_writes`
pub fn set_chat_inflight_writes(backend: &'static str, in_flight: usize) {
    #[allow(clippy::cast_precision_loss)]
    let in_flight = in_flight as f64;
    gauge!("sc_chat_inflight_writes", "backend" => backend).set(in_flight);
}
