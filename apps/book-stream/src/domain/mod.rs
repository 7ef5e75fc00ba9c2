//! Domain Layer - Order-book and subscription types.
//!
//! This layer holds the venue-neutral types the engine reasons about:
//! subscription intents and phases, channel bindings, classified inbound
//! frames and the per-symbol order-book store. Nothing here performs I/O.

/// Channel id to subscription bindings.
pub mod channel;

/// Connection context identity.
pub mod connection;

/// Classified inbound frames and protocol errors.
pub mod frame;

/// Per-symbol order-book state and merge logic.
pub mod order_book;

/// Subscription intents, keys and lifecycle phases.
pub mod subscription;
