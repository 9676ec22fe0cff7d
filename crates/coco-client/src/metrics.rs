//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use cocoschool_core::HubStats;
use cocoschool_transport::ConnectionState;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const FRAMES_TOTAL: &str = "cocoschool_frames_total";
    pub const MALFORMED_FRAMES_TOTAL: &str = "cocoschool_malformed_frames_total";
    pub const RECONNECTS_TOTAL: &str = "cocoschool_reconnects_total";
    pub const CONNECTED: &str = "cocoschool_connected";
    pub const SENDS_TOTAL: &str = "cocoschool_sends_total";
    pub const CHANNELS_ACTIVE: &str = "cocoschool_channels_active";
    pub const CACHED_EVENTS: &str = "cocoschool_cached_events";
    pub const EVICTIONS_TOTAL: &str = "cocoschool_cache_evictions_total";
    pub const SUBSCRIBER_PANICS_TOTAL: &str = "cocoschool_subscriber_panics_total";
    pub const ALERTS_TOTAL: &str = "cocoschool_alerts_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::FRAMES_TOTAL,
        "Live connection frames, by direction"
    );
    metrics::describe_counter!(
        names::MALFORMED_FRAMES_TOTAL,
        "Inbound frames dropped because they did not decode"
    );
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Scheduled reconnect attempts");
    metrics::describe_gauge!(names::CONNECTED, "1 while the live connection is up");
    metrics::describe_counter!(names::SENDS_TOTAL, "Message sends, by outcome");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Channels with local state");
    metrics::describe_gauge!(names::CACHED_EVENTS, "Events held in the local cache");
    metrics::describe_counter!(names::EVICTIONS_TOTAL, "Events evicted from the local cache");
    metrics::describe_counter!(
        names::SUBSCRIBER_PANICS_TOTAL,
        "Subscriber callbacks that panicked during dispatch"
    );
    metrics::describe_counter!(names::ALERTS_TOTAL, "System alerts, by outcome");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a live frame.
pub fn record_frame(direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
}

/// Record a dropped inbound frame.
pub fn record_malformed() {
    counter!(names::MALFORMED_FRAMES_TOTAL).increment(1);
}

/// Record a connection state change.
pub fn record_connection_state(state: ConnectionState) {
    gauge!(names::CONNECTED).set(if state.is_connected() { 1.0 } else { 0.0 });
    if let ConnectionState::Reconnecting { .. } = state {
        counter!(names::RECONNECTS_TOTAL).increment(1);
    }
}

/// Record the outcome of a send ("sent" or "failed").
pub fn record_send(outcome: &'static str) {
    counter!(names::SENDS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record the outcome of surfacing a system alert.
pub fn record_alert(outcome: &'static str) {
    counter!(names::ALERTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Export hub statistics.
pub fn record_hub_stats(stats: &HubStats) {
    gauge!(names::CHANNELS_ACTIVE).set(stats.channel_count as f64);
    gauge!(names::CACHED_EVENTS).set(stats.cached_events as f64);
    counter!(names::EVICTIONS_TOTAL).absolute(stats.evicted_total);
    counter!(names::SUBSCRIBER_PANICS_TOTAL).absolute(stats.subscriber_panics);
}
