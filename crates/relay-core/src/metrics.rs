//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; without an installed
//! recorder every call is a no-op. The binary installs the Prometheus
//! exporter and describes these names.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "relay_connections_active";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const MESSAGES_BYTES: &str = "relay_messages_bytes";
    pub const MALFORMED_TOTAL: &str = "relay_malformed_total";
    pub const LATENCY_SECONDS: &str = "relay_latency_seconds";
    pub const ERRORS_TOTAL: &str = "relay_errors_total";
}

/// Inbound message direction label.
pub const INBOUND: &str = "inbound";
/// Outbound message direction label.
pub const OUTBOUND: &str = "outbound";

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record a dropped malformed frame.
pub fn record_malformed() {
    counter!(names::MALFORMED_TOTAL).increment(1);
}

/// Record routing latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}
