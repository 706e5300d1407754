//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (dispatches, relays, tunnels, errors, connections)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `proxy_dispatch_total` (counter): requests by plugin and outcome
//! - `proxy_relay_total` (counter): relayed requests by method and status
//! - `proxy_relay_duration_seconds` (histogram): upstream round-trip latency
//! - `proxy_tunnels_total` (counter): tunnels opened, by plugin
//! - `proxy_plugin_errors_total` (counter): plugin failures
//! - `proxy_accept_errors_total` (counter): accept failures, transient or fatal
//! - `proxy_active_connections` (gauge): current connection count
//!
//! # Design Decisions
//! - Low-overhead metric updates; without an installed recorder they are no-ops
//! - Labels limited to low-cardinality values

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from inside a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_active_connections(count: u64) {
    gauge!("proxy_active_connections").set(count as f64);
}

pub fn record_accept_error(transient: bool) {
    let kind = if transient { "transient" } else { "fatal" };
    counter!("proxy_accept_errors_total", "kind" => kind).increment(1);
}

pub fn record_dispatch(plugin: &str, outcome: &'static str) {
    counter!("proxy_dispatch_total", "plugin" => plugin.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_relay(method: &str, status: u16, started: Instant) {
    counter!(
        "proxy_relay_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("proxy_relay_duration_seconds").record(started.elapsed().as_secs_f64());
}

pub fn record_tunnel(plugin: &'static str) {
    counter!("proxy_tunnels_total", "plugin" => plugin).increment(1);
}

pub fn record_plugin_error(plugin: &str) {
    counter!("proxy_plugin_errors_total", "plugin" => plugin.to_string()).increment(1);
}
