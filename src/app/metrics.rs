//! Prometheus-based metrics module
//!
//! Counters are updated by the transports and services. The HTTP service
//! in the binary exposes them on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Connection Metrics ===

    /// Connections established (accepted or connected)
    pub static ref CONNECTIONS_TOTAL: IntCounter = IntCounter::new(
        "tcpnet_connections_total",
        "Total number of established connections"
    ).unwrap();

    /// Currently connected transports
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "tcpnet_connections_active",
        "Number of currently connected transports"
    ).unwrap();

    /// Failed outbound connect attempts
    pub static ref CONNECTIONS_FAILED: IntCounter = IntCounter::new(
        "tcpnet_connections_failed_total",
        "Total number of failed connect attempts"
    ).unwrap();

    // === Traffic Metrics ===

    pub static ref BYTES_RECEIVED: IntCounter = IntCounter::new(
        "tcpnet_bytes_received_total",
        "Total bytes read from sockets"
    ).unwrap();

    pub static ref BYTES_SENT: IntCounter = IntCounter::new(
        "tcpnet_bytes_sent_total",
        "Total bytes written to sockets"
    ).unwrap();

    // === HTTP Metrics ===

    /// Requests handed to the application
    pub static ref HTTP_REQUESTS: IntCounter = IntCounter::new(
        "tcpnet_http_requests_total",
        "Total number of assembled HTTP requests"
    ).unwrap();

    /// Connections dropped for protocol violations
    pub static ref PROTOCOL_ERRORS: IntCounter = IntCounter::new(
        "tcpnet_protocol_errors_total",
        "Total number of connections closed for protocol errors"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_FAILED.clone())).ok();

    REGISTRY.register(Box::new(BYTES_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(BYTES_SENT.clone())).ok();

    REGISTRY.register(Box::new(HTTP_REQUESTS.clone())).ok();
    REGISTRY.register(Box::new(PROTOCOL_ERRORS.clone())).ok();
}

/// Registry contents in the Prometheus text format
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_text_lists_registered_metrics() {
        init_metrics();
        init_metrics();
        HTTP_REQUESTS.inc();

        let text = gather_text();
        assert!(text.contains("tcpnet_http_requests_total"));
        assert!(text.contains("tcpnet_connections_active"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
