//! Prometheus metrics.
//!
//! Thin wrappers over the `metrics` facade so call sites stay one-liners.
//! Without an installed recorder every call is a no-op, which keeps unit
//! tests free of global setup.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the global Prometheus recorder once per process.
///
/// Returns `None` if another recorder was installed first.
pub fn init() -> Option<&'static PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Prometheus recorder not installed: {}", e);
                None
            }
        })
        .as_ref()
}

/// Render the current metrics in Prometheus text format.
pub fn render() -> String {
    init().map(PrometheusHandle::render).unwrap_or_default()
}

pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "hlsrelay_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("hlsrelay_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error() {
    counter!("hlsrelay_upstream_errors_total").increment(1);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("hlsrelay_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_cache_evictions(count: usize) {
    counter!("hlsrelay_cache_evictions_total").increment(count as u64);
}

pub fn record_prefetch(success: bool) {
    let result = if success { "ok" } else { "error" };
    counter!("hlsrelay_prefetch_total", "result" => result).increment(1);
}

pub fn live_session_started() {
    gauge!("hlsrelay_live_sessions").increment(1.0);
}

pub fn live_session_stopped() {
    gauge!("hlsrelay_live_sessions").decrement(1.0);
}

pub fn viewer_attached() {
    gauge!("hlsrelay_live_viewers").increment(1.0);
}

pub fn viewer_detached() {
    gauge!("hlsrelay_live_viewers").decrement(1.0);
}

pub fn record_stream_bytes(bytes: usize) {
    counter!("hlsrelay_live_bytes_total").increment(bytes as u64);
}
