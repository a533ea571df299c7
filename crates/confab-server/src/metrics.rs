//! Metrics collection and export for the Confab gateway.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "confab_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "confab_connections_active";
    pub const MESSAGES_TOTAL: &str = "confab_messages_total";
    pub const READ_RECEIPTS_TOTAL: &str = "confab_read_receipts_total";
    pub const TYPING_SIGNALS_TOTAL: &str = "confab_typing_signals_total";
    pub const GROUPS_ACTIVE: &str = "confab_groups_active";
    pub const ASSISTANT_TURNS_TOTAL: &str = "confab_assistant_turns_total";
    pub const ACTION_SECONDS: &str = "confab_action_seconds";
    pub const ERRORS_TOTAL: &str = "confab_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    // Describe metrics
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total chat messages processed");
    metrics::describe_counter!(
        names::READ_RECEIPTS_TOTAL,
        "Total read-receipt updates applied"
    );
    metrics::describe_counter!(
        names::TYPING_SIGNALS_TOTAL,
        "Total typing signals relayed"
    );
    metrics::describe_gauge!(names::GROUPS_ACTIVE, "Current number of live groups");
    metrics::describe_counter!(
        names::ASSISTANT_TURNS_TOTAL,
        "Total assistant turns, labeled by outcome"
    );
    metrics::describe_histogram!(names::ACTION_SECONDS, "Action handling latency in seconds");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a chat message, labeled by author side.
pub fn record_message(author: &str) {
    counter!(names::MESSAGES_TOTAL, "author" => author.to_string()).increment(1);
}

/// Record a read-receipt update.
pub fn record_read_receipt() {
    counter!(names::READ_RECEIPTS_TOTAL).increment(1);
}

/// Record a typing signal.
pub fn record_typing_signal() {
    counter!(names::TYPING_SIGNALS_TOTAL).increment(1);
}

/// Record action handling latency.
pub fn record_action_latency(seconds: f64) {
    histogram!(names::ACTION_SECONDS).record(seconds);
}

/// Record an assistant turn outcome ("ok", "unavailable", "store_error").
pub fn record_assistant_turn(outcome: &str) {
    counter!(names::ASSISTANT_TURNS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

/// Update active group count.
pub fn set_active_groups(count: usize) {
    gauge!(names::GROUPS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }
}
