//! Configuration Module
//!
//! Environment-driven configuration for the book stream binary.

mod settings;

pub use settings::{ConfigError, DEFAULT_SYMBOLS, EngineConfig, WebSocketSettings};
