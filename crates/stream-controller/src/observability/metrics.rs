//! Service-level metrics.
//!
//! Component metrics live in each crate's own `metrics` module; these cover
//! viewer sessions and stream lifecycle. Labels are bounded: `action`
//! (connect/disconnect/report), `status` (success or an error code),
//! `state` (live/ended).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a viewer session operation.
///
/// Metric: `sc_viewer_sessions_total`, `sc_viewer_session_duration_seconds`
/// Labels: `action`, `status`
pub fn record_session_operation(action: &str, status: &str, duration: Duration) {
    histogram!("sc_viewer_session_duration_seconds",
        "action" => action.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("sc_viewer_sessions_total",
        "action" => action.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Publish the number of sessions held by this replica.
///
/// Metric: `sc_viewer_sessions_active`
pub fn set_active_sessions(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    let count = count as f64;
    gauge!("sc_viewer_sessions_active").set(count);
}

/// Record a stream lifecycle transition.
///
/// Metric: `sc_stream_transitions_total`
/// Labels: `state`
pub fn record_stream_transition(state: &str) {
    counter!("sc_stream_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Publish the number of live streams.
///
/// Metric: `sc_streams_live`
pub fn set_live_streams(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    let count = count as f64;
    gauge!("sc_streams_live").set(count);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_record_functions_with_global_recorder() {
        record_session_operation("connect", "success", Duration::from_micros(300));
        record_session_operation("disconnect", "session_not_found", Duration::ZERO);
        set_active_sessions(12);
        record_stream_transition("live");
        set_live_streams(1);
    }

    #[test]
    fn test_session_counter_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_session_operation("connect", "no_available_server", Duration::ZERO);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let (key, _, _, value) = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "sc_viewer_sessions_total")
            .expect("counter recorded");

        assert!(key
            .key()
            .labels()
            .any(|l| l.key() == "status" && l.value() == "no_available_server"));
        assert_eq!(value, &DebugValue::Counter(1));
    }
}
