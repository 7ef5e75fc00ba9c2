//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the subscription lifecycle services and the port
//! interfaces through which venue dialects, transports and consumers plug in.

/// Port interfaces for transports, dialects and event consumers.
pub mod ports;

/// Subscription coordination, dispatch and per-context drivers.
pub mod services;
