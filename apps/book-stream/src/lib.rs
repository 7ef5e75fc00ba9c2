#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Book Stream - Venue Order-Book Subscription Engine
//!
//! Maintains live per-symbol order books over venue WebSocket connections.
//! Each connection context correlates subscribe requests with the venue's
//! acknowledgments by nonce, applies inbound depth updates to its book store
//! and keeps the socket alive with dialect-specific pings.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Venue-neutral types
//!   - `subscription`: Intents, keys, side flags and phases
//!   - `channel`: Venue channel to subscription bindings
//!   - `frame`: Classified inbound frames and protocol errors
//!   - `order_book`: Per-symbol book store and merge rules
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, venue dialect and event sink interfaces
//!   - `services`: Coordinator, dispatcher, heartbeat, context driver
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `venue`: OKEx and Liquid dialects
//!   - `transport`: WebSocket connector with reconnect
//!   - `config`: Environment configuration
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                  +-----------------+      +------------+
//! venue WS ------> | ContextDriver   | ---> | Dispatcher | --> EventSink
//!   ^              | (one per socket)|      +------------+
//!   |              +-----------------+            |
//!   |                    ^    |                   v
//!   |   ContextHandle ---+    |           SubscriptionCoordinator
//!   |                         v                   |
//!   +------------------ OutboundRouter <----------+
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Venue-neutral types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::ContextId;
pub use domain::order_book::{OrderBookState, OrderBookStore, PriceLevel};
pub use domain::subscription::{
    EventKind, Nonce, SideFlags, SubscribeOptions, SubscriptionIntent, SubscriptionKey,
    SubscriptionPhase, Symbol,
};

// Ports
pub use application::ports::{
    DialectCapabilities, EngineEvent, EventSink, Transport, TransportError, VenueProtocol,
};

// Services
pub use application::services::{
    ContextHandle, Engine, EngineSettings, SubscriptionError, SubscriptionOutcome,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, EngineConfig};

// Transport
pub use infrastructure::transport::{OutboundRouter, WebSocketConnector};

// Venues
pub use infrastructure::venue::VenueKind;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
