//! Metrics collection and export for the Killfeed client.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use killfeed_core::EventKind;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "killfeed_connections_total";
    pub const CONNECTED: &str = "killfeed_connected";
    pub const EVENTS_TOTAL: &str = "killfeed_events_total";
    pub const KILLMAILS_TOTAL: &str = "killfeed_killmails_total";
    pub const SUBSCRIBED_SYSTEMS: &str = "killfeed_subscribed_systems";
    pub const EVENTS_LAGGED_TOTAL: &str = "killfeed_events_lagged_total";
    pub const ERRORS_TOTAL: &str = "killfeed_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of successful channel joins"
    );
    metrics::describe_gauge!(names::CONNECTED, "1 while the session is joined");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Session events received, by kind");
    metrics::describe_counter!(names::KILLMAILS_TOTAL, "Killmails received");
    metrics::describe_gauge!(
        names::SUBSCRIBED_SYSTEMS,
        "Systems in the local subscription set"
    );
    metrics::describe_counter!(
        names::EVENTS_LAGGED_TOTAL,
        "Events dropped because the consumer fell behind"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a successful join.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTED).set(1.0);
}

/// Record the session closing.
pub fn record_disconnection() {
    gauge!(names::CONNECTED).set(0.0);
}

/// Record a session event.
pub fn record_event(kind: EventKind) {
    counter!(names::EVENTS_TOTAL, "kind" => kind.as_str()).increment(1);
}

/// Record received killmails.
pub fn record_killmails(count: usize) {
    counter!(names::KILLMAILS_TOTAL).increment(count as u64);
}

/// Update the subscribed system count.
pub fn set_subscribed_systems(count: usize) {
    gauge!(names::SUBSCRIBED_SYSTEMS).set(count as f64);
}

/// Record events lost to a lagging consumer.
pub fn record_lagged(skipped: u64) {
    counter!(names::EVENTS_LAGGED_TOTAL).increment(skipped);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
