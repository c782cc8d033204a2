//! Metrics collection and exposition.
//!
//! # Metrics
//! - `nsmgr_listeners_bound` (gauge): listeners currently serving
//! - `nsmgr_identity_renewals_total` (counter): renewal attempts by outcome
//! - `nsmgr_shutdowns_total` (counter): shutdown triggers by cause
//! - `nsmgr_startup_duration_seconds` (histogram): time from start to all listeners bound
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade and is a no-op until an exporter is installed
//! - The Prometheus exporter is opt-in via `observability.metrics_enabled`

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn listener_bound() {
    metrics::gauge!("nsmgr_listeners_bound").increment(1.0);
}

pub fn listener_closed() {
    metrics::gauge!("nsmgr_listeners_bound").decrement(1.0);
}

pub fn record_identity_renewal(ok: bool) {
    let outcome = if ok { "success" } else { "failure" };
    metrics::counter!("nsmgr_identity_renewals_total", "outcome" => outcome).increment(1);
}

pub fn record_shutdown(cause: &'static str) {
    metrics::counter!("nsmgr_shutdowns_total", "cause" => cause).increment(1);
}

pub fn record_startup(elapsed: Duration) {
    metrics::histogram!("nsmgr_startup_duration_seconds").record(elapsed.as_secs_f64());
}
