//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_accepted_total` (counter)
//! - `proxy_connections_rejected_total` (counter): refused over `max_connections`
//! - `proxy_active_connections` (gauge): live connection contexts
//! - `proxy_responses_total` (counter): by status, generated or forwarded
//! - `proxy_pool_acquire_total` (counter): by result, `hit` or `miss`
//! - `proxy_pool_reaped_total` (counter): idle upstream sockets closed by sweeps
//! - `proxy_backend_health` (gauge): 1=healthy, 0=unhealthy
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use ::metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_accepted() {
    counter!("proxy_connections_accepted_total").increment(1);
}

pub fn record_connection_rejected() {
    counter!("proxy_connections_rejected_total").increment(1);
}

pub fn set_active_connections(count: usize) {
    gauge!("proxy_active_connections").set(count as f64);
}

pub fn record_response(status: u16) {
    counter!("proxy_responses_total", "status" => status.to_string()).increment(1);
}

pub fn record_pool_acquire(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("proxy_pool_acquire_total", "result" => result).increment(1);
}

pub fn record_pool_reaped(count: usize) {
    counter!("proxy_pool_reaped_total").increment(count as u64);
}

pub fn record_backend_health(backend: &str, healthy: bool) {
    gauge!("proxy_backend_health", "backend" => backend.to_string()).set(if healthy { 1.0 } else { 0.0 });
}
