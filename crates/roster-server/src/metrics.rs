//! Metrics collection and export for roster.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use roster_core::{EmitReport, PrincipalKind, TransitionKind};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roster_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roster_connections_active";
    pub const FRAMES_TOTAL: &str = "roster_frames_total";
    pub const FRAMES_BYTES: &str = "roster_frames_bytes";
    pub const TRANSITIONS_TOTAL: &str = "roster_presence_transitions_total";
    pub const AUTH_FAILURES_TOTAL: &str = "roster_auth_failures_total";
    pub const FANOUT_DELIVERIES_TOTAL: &str = "roster_fanout_deliveries_total";
    pub const LATENCY_SECONDS: &str = "roster_latency_seconds";
    pub const ERRORS_TOTAL: &str = "roster_errors_total";
}

pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames processed");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total bytes of frames processed");
    metrics::describe_counter!(
        names::TRANSITIONS_TOTAL,
        "Online/offline transitions observed on the lifecycle channels"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Rejected login attempts"
    );
    metrics::describe_counter!(
        names::FANOUT_DELIVERIES_TOTAL,
        "Fan-out delivery attempts by outcome"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Inbound frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

pub fn record_transition(kind: PrincipalKind, transition: TransitionKind) {
    counter!(
        names::TRANSITIONS_TOTAL,
        "kind" => kind.as_str(),
        "transition" => transition.event_name()
    )
    .increment(1);
}

pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

pub fn record_emit(report: &EmitReport) {
    for (outcome, count) in [
        ("delivered", report.delivered),
        ("rejected", report.rejected),
        ("stale", report.stale),
        ("failed", report.failed),
    ] {
        if count > 0 {
            counter!(names::FANOUT_DELIVERIES_TOTAL, "outcome" => outcome).increment(count as u64);
        }
    }
}

pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
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
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_transition(PrincipalKind::User, TransitionKind::Online);
        record_emit(&EmitReport {
            delivered: 2,
            stale: 1,
            ..EmitReport::default()
        });
    }
}
