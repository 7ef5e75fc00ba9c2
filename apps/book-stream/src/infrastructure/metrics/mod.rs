//! Prometheus Metrics Module
//!
//! Exposes engine metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Frames**: Inbound frames by type, protocol errors by category
//! - **Books**: Applied and stale depth updates
//! - **Subscriptions**: Outcomes by result, pending count
//! - **Connection**: Heartbeats sent, reconnection attempts
//!
//! # Integration
//!
//! The exporter serves `/metrics` on its own listener.
//! Recording functions are no-ops until a recorder is installed.

use std::net::SocketAddr;
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// =============================================================================
// Global Metrics State
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `port`.
///
/// Calling this again after a successful install is a no-op.
///
/// # Errors
///
/// Returns an error if the recorder or the listener cannot be installed.
pub fn init_metrics(port: u16) -> Result<SocketAddr, BuildError> {
    if let Some(addr) = INSTALLED.get() {
        return Ok(*addr);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    register_metrics();

    Ok(*INSTALLED.get_or_init(|| addr))
}

/// Get the metrics listener address.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn metrics_addr() -> Option<SocketAddr> {
    INSTALLED.get().copied()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "book_stream_frames_received_total",
        "Total decoded inbound frames by type"
    );
    describe_counter!(
        "book_stream_protocol_errors_total",
        "Total malformed or unsupported inbound payloads"
    );
    describe_counter!(
        "book_stream_book_updates_total",
        "Total depth updates applied to the order-book store"
    );
    describe_counter!(
        "book_stream_stale_updates_total",
        "Total incremental updates dropped for a stale sequence marker"
    );
    describe_counter!(
        "book_stream_subscription_outcomes_total",
        "Total resolved subscription requests by result"
    );
    describe_gauge!(
        "book_stream_pending_subscriptions",
        "Subscription requests awaiting acknowledgment"
    );
    describe_counter!(
        "book_stream_heartbeats_sent_total",
        "Total keep-alive frames sent"
    );
    describe_counter!(
        "book_stream_reconnects_total",
        "Total WebSocket reconnection attempts"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for subscription results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Every required side acknowledged.
    Acknowledged,
    /// Timer fired first.
    Timeout,
    /// Torn down or unsubscribed while pending.
    Cancelled,
}

impl OutcomeKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Record a decoded inbound frame.
pub fn record_frame(venue: &'static str, frame_type: &'static str) {
    counter!(
        "book_stream_frames_received_total",
        "venue" => venue,
        "frame_type" => frame_type
    )
    .increment(1);
}

/// Record a protocol error.
pub fn record_protocol_error(venue: &'static str, category: &'static str) {
    counter!(
        "book_stream_protocol_errors_total",
        "venue" => venue,
        "category" => category
    )
    .increment(1);
}

/// Record an applied depth update.
pub fn record_book_update(venue: &'static str, shape: &'static str) {
    counter!(
        "book_stream_book_updates_total",
        "venue" => venue,
        "shape" => shape
    )
    .increment(1);
}

/// Record a dropped stale update.
pub fn record_stale_update(venue: &'static str) {
    counter!("book_stream_stale_updates_total", "venue" => venue).increment(1);
}

/// Record resolved subscription requests.
pub fn record_outcome(venue: &'static str, outcome: OutcomeKind, count: usize) {
    counter!(
        "book_stream_subscription_outcomes_total",
        "venue" => venue,
        "outcome" => outcome.as_str()
    )
    .increment(count as u64);
}

/// Record a newly pending subscription request.
pub fn add_pending(venue: &'static str) {
    gauge!("book_stream_pending_subscriptions", "venue" => venue).increment(1.0);
}

/// Record pending subscription requests leaving the table.
#[allow(clippy::cast_precision_loss)]
pub fn remove_pending(venue: &'static str, count: usize) {
    gauge!("book_stream_pending_subscriptions", "venue" => venue).decrement(count as f64);
}

/// Record a keep-alive frame sent.
pub fn record_heartbeat(venue: &'static str) {
    counter!("book_stream_heartbeats_sent_total", "venue" => venue).increment(1);
}

/// Record a WebSocket reconnection attempt.
pub fn record_reconnect(venue: &'static str) {
    counter!("book_stream_reconnects_total", "venue" => venue).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
