//! Prometheus Metrics Module
//!
//! Exposes ingestion metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Stream**: Frames received, requests written, reconnects, state
//! - **Admission**: Outstanding fetches
//! - **Apply**: Responses by outcome, bars stored, apply latency
//! - **Relay**: Ticks published
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::exchange::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "kline_ingest_frames_received_total",
        "Non-keepalive frames received from the exchange by kind"
    );
    describe_counter!(
        "kline_ingest_requests_sent_total",
        "Frames written to the exchange connection"
    );
    describe_counter!(
        "kline_ingest_send_failures_total",
        "Frame writes that failed and ended the session"
    );
    describe_counter!(
        "kline_ingest_reconnects_total",
        "Sessions opened after the first one"
    );
    describe_gauge!(
        "kline_ingest_connection_state",
        "Connection state (0 disconnected, 1 connecting, 2 connected, 3 stopped)"
    );

    describe_gauge!(
        "kline_ingest_in_flight_requests",
        "Fetch requests awaiting a response"
    );

    describe_counter!(
        "kline_ingest_responses_total",
        "Fetch responses applied by outcome"
    );
    describe_counter!(
        "kline_ingest_bars_total",
        "Bars written by result (inserted or duplicate)"
    );
    describe_histogram!(
        "kline_ingest_apply_seconds",
        "Time to apply one fetch response"
    );

    describe_counter!(
        "kline_ingest_ticks_published_total",
        "Live ticks forwarded to the publish bus by result"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a decoded non-keepalive frame.
pub fn record_frame_received(kind: &'static str) {
    counter!("kline_ingest_frames_received_total", "kind" => kind).increment(1);
}

/// Record a frame written to the socket.
pub fn record_request_sent() {
    counter!("kline_ingest_requests_sent_total").increment(1);
}

/// Record a failed frame write.
pub fn record_send_failure() {
    counter!("kline_ingest_send_failures_total").increment(1);
}

/// Record a reconnected session.
pub fn record_reconnect() {
    counter!("kline_ingest_reconnects_total").increment(1);
}

/// Update the connection state gauge.
pub fn set_connection_state(state: ConnectionState) {
    let value = match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
        ConnectionState::Stopped => 3.0,
    };
    gauge!("kline_ingest_connection_state").set(value);
}

/// Update the outstanding fetch gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_in_flight(count: usize) {
    gauge!("kline_ingest_in_flight_requests").set(count as f64);
}

/// Record an applied response by outcome label.
pub fn record_response(outcome: &'static str) {
    counter!("kline_ingest_responses_total", "outcome" => outcome).increment(1);
}

/// Record bars written by one response.
pub fn record_bars(inserted: usize, duplicates: usize) {
    counter!("kline_ingest_bars_total", "result" => "inserted")
        .increment(u64::try_from(inserted).unwrap_or(u64::MAX));
    counter!("kline_ingest_bars_total", "result" => "duplicate")
        .increment(u64::try_from(duplicates).unwrap_or(u64::MAX));
}

/// Record how long applying a response took.
pub fn record_apply_duration(duration: Duration) {
    histogram!("kline_ingest_apply_seconds").record(duration.as_secs_f64());
}

/// Record a tick publish attempt.
pub fn record_tick_published(ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("kline_ingest_ticks_published_total", "result" => result).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
