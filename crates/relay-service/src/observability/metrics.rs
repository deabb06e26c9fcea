//! Metrics definitions for the relay service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `relay_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Every label is bounded by code, never by room codes or user ids:
//! - `actor_type`: registry, room, connection
//! - `mode`: unicast, broadcast
//! - `reason`: `not_announced`, `room_mismatch`, `unknown_target`, backpressure, closed
//! - `event`: join, leave, announce, depart, evict, end
//! - `operation`: create, `record_join`, `record_leave`, delete
//! - `endpoint`: route templates (`/meet/{room_code}`), never raw paths

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used by
/// `GET /metrics`.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Durable store latency buckets (store calls are bounded by RELAY_STORE_TIMEOUT_MS)
        .set_buckets_for_metric(
            Matcher::Prefix("relay_store".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `relay_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_rooms_active").set(count as f64);
}

/// Metric: `relay_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_connections_active").set(count as f64);
}

/// Metric: `relay_participants_active`
///
/// Sum of ledger sizes across rooms, including HTTP-only members.
pub fn set_participants_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_participants_active").set(count as f64);
}

/// Metric: `relay_actor_mailbox_depth`
/// Labels: `actor_type`
///
/// Only set when a mailbox leaves the normal band.
pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("relay_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `relay_signals_forwarded_total`
/// Labels: `mode`, `kind`
pub fn record_signal_forwarded(mode: &'static str, kind: &'static str) {
    counter!("relay_signals_forwarded_total", "mode" => mode, "kind" => kind).increment(1);
}

/// Metric: `relay_signals_dropped_total`
/// Labels: `reason`
pub fn record_signal_dropped(reason: &'static str) {
    counter!("relay_signals_dropped_total", "reason" => reason).increment(1);
}

/// Metric: `relay_membership_events_total`
/// Labels: `event`
pub fn record_membership_event(event: &'static str) {
    counter!("relay_membership_events_total", "event" => event).increment(1);
}

/// Metric: `relay_store_failures_total`
/// Labels: `operation`
///
/// Failures are swallowed by the lifecycle coordinator; this is the only trace
/// besides the warn log.
pub fn record_store_failure(operation: &'static str) {
    counter!("relay_store_failures_total", "operation" => operation).increment(1);
}

/// Metric: `relay_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &'static str) {
    counter!("relay_messages_dropped_total", "actor_type" => actor_type).increment(1);
}

/// Metric: `relay_actor_panics_total`
/// Labels: `actor_type`
///
/// ALERT: Any non-zero value indicates a bug and should trigger investigation.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("relay_actor_panics_total", "actor_type" => actor_type).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Metric: `relay_store_latency_seconds`
/// Labels: `operation`, `status`
pub fn record_store_latency(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!(
        "relay_store_latency_seconds",
        "operation" => operation,
        "status" => status
    )
    .record(duration.as_secs_f64());
}

/// Metrics: `relay_http_requests_total`, `relay_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status_code` / `status`
pub fn record_http_request(method: &str, path: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(path);
    let status = categorize_status_code(status_code);

    histogram!("relay_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("relay_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

/// Map a request path to a bounded route template.
fn normalize_endpoint(path: &str) -> &'static str {
    match path {
        "/health" => "/health",
        "/ready" => "/ready",
        "/metrics" => "/metrics",
        "/ws" => "/ws",
        "/meet/create" => "/meet/create",
        "/meet/join" => "/meet/join",
        "/meet/leave" => "/meet/leave",
        "/meet/end" => "/meet/end",
        _ => {
            let rest = path.strip_prefix("/meet/").map(|r| r.trim_end_matches('/'));
            match rest {
                Some(code) if !code.is_empty() && !code.contains('/') => "/meet/{room_code}",
                _ => "other",
            }
        }
    }
}
