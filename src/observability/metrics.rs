//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_connections_accepted_total` (counter)
//! - `proxy_connections_active` (gauge)
//! - `proxy_requests_total` (counter): by `outcome`
//! - `proxy_request_duration_seconds` (histogram)
//! - `proxy_auth_denied_total` (counter)
//! - `proxy_filtered_responses_total` (counter)
//! - `proxy_filter_overflow_total` (counter)
//! - `proxy_relay_errors_total` (counter): by `kind`
//! - `proxy_tunnels_total` (counter): by `mode` (opaque, intercept)
//! - `proxy_certificates_minted_total` (counter)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus exporter with its own scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened() {
    counter!("proxy_connections_accepted_total").increment(1);
    gauge!("proxy_connections_active").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("proxy_connections_active").decrement(1.0);
}

pub fn record_request(outcome: &'static str, start: Instant) {
    counter!("proxy_requests_total", "outcome" => outcome).increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_auth_denied() {
    counter!("proxy_auth_denied_total").increment(1);
}

pub fn record_filtered_response() {
    counter!("proxy_filtered_responses_total").increment(1);
}

pub fn record_filter_overflow() {
    counter!("proxy_filter_overflow_total").increment(1);
}

pub fn record_relay_error(kind: &'static str) {
    counter!("proxy_relay_errors_total", "kind" => kind).increment(1);
}

pub fn record_tunnel(mode: &'static str) {
    counter!("proxy_tunnels_total", "mode" => mode).increment(1);
}

pub fn record_certificate_minted() {
    counter!("proxy_certificates_minted_total").increment(1);
}
