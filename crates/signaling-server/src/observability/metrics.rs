//! Metrics definitions for the signaling server.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `actor_type`: 3 values (pool, registry, room)
//! - `method`: bounded by the signaling method table (~20 values)
//! - `status`: success, error
//! - `error_type`: bounded by `SignalingError::error_type_label`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round-trips are dominated by engine calls
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Peer Metrics (Gauges)
// ============================================================================

/// Set the number of active rooms.
///
/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Set the number of joined peers across all rooms.
///
/// Metric: `sfu_peers_active`
pub fn set_peers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_peers_active").set(count as f64);
}

// ============================================================================
// Worker Metrics
// ============================================================================

/// Set the number of live media workers.
///
/// Metric: `sfu_workers_alive`
///
/// ALERT: zero means the process is about to exit.
pub fn set_workers_alive(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_workers_alive").set(count as f64);
}

/// Record an unexpected worker death.
///
/// Metric: `sfu_worker_deaths_total`
pub fn record_worker_death() {
    counter!("sfu_worker_deaths_total").increment(1);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record one handled signaling request.
///
/// Metrics: `sfu_signaling_requests_total{method,status}` and
/// `sfu_signaling_latency_seconds{method}`
///
/// `method` is "unknown" for unparseable or unsupported requests.
pub fn record_signaling_request(method: &str, status: &str, duration: Duration) {
    counter!("sfu_signaling_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!("sfu_signaling_latency_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

// ============================================================================
// Actor Metrics
// ============================================================================

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type` (pool, registry, room)
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Record an actor panic event.
///
/// Metric: `sfu_actor_panics_total`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Error Metrics
// ============================================================================

/// Record error by category.
///
/// Metric: `sfu_errors_total`
/// Labels: `error_type`
pub fn record_error(error_type: &str) {
    counter!("sfu_errors_total", "error_type" => error_type.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    fn counter_value(
        snapshot: Vec<(
            metrics_util::CompositeKey,
            Option<metrics::Unit>,
            Option<metrics::SharedString>,
            DebugValue,
        )>,
        name: &str,
    ) -> Option<u64> {
        snapshot.into_iter().find_map(|(key, _, _, value)| {
            if key.key().name() != name {
                return None;
            }
            match value {
                DebugValue::Counter(v) => Some(v),
                _ => None,
            }
        })
    }

    #[test]
    fn test_gauges_record_without_recorder() {
        // Falls through to the no-op recorder
        set_rooms_active(0);
        set_peers_active(12);
        set_workers_alive(4);
        set_actor_mailbox_depth("room", 3);
    }

    #[test]
    fn test_worker_death_counter() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_worker_death();
            record_worker_death();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(counter_value(snapshot, "sfu_worker_deaths_total"), Some(2));
    }

    #[test]
    fn test_signaling_request_records_counter_and_histogram() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_signaling_request("produce", "success", Duration::from_millis(4));
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let names: Vec<String> = snapshot
            .iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();
        assert!(names.contains(&"sfu_signaling_requests_total".to_string()));
        assert!(names.contains(&"sfu_signaling_latency_seconds".to_string()));
    }

    #[test]
    fn test_error_counter_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_error("room_capacity_exceeded");
            record_actor_panic("room");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let error_labels: Vec<String> = snapshot
            .iter()
            .filter(|(key, _, _, _)| key.key().name() == "sfu_errors_total")
            .flat_map(|(key, _, _, _)| key.key().labels().map(|l| l.value().to_string()))
            .collect();
        assert_eq!(error_labels, vec!["room_capacity_exceeded".to_string()]);
    }
}
