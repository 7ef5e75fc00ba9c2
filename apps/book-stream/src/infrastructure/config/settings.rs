//! Engine Configuration Settings
//!
//! Configuration types for the book stream, loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::application::services::{DEFAULT_SUBSCRIBE_TIMEOUT, EngineSettings};
use crate::domain::subscription::{SubscribeOptions, Symbol};
use crate::infrastructure::transport::{ConnectorConfig, ReconnectConfig};
use crate::infrastructure::venue::VenueKind;

/// Symbols subscribed when none are configured.
pub const DEFAULT_SYMBOLS: &str = "BTC/USDT";

/// WebSocket reconnection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketSettings {
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

impl WebSocketSettings {
    /// Backoff parameters for the connector.
    #[must_use]
    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: self.reconnect_delay_initial,
            max_delay: self.reconnect_delay_max,
            multiplier: self.reconnect_delay_multiplier,
            max_attempts: self.max_reconnect_attempts,
            ..ReconnectConfig::default()
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Venue dialect.
    pub venue: VenueKind,
    /// WebSocket endpoint.
    pub url: String,
    /// Symbols subscribed on every connection.
    pub symbols: Vec<Symbol>,
    /// Options applied to every subscription.
    pub options: SubscribeOptions,
    /// Time to wait for subscribe acknowledgments.
    pub subscribe_timeout: Duration,
    /// Keep-alive override; the dialect default applies when `None`.
    pub heartbeat_interval: Option<Duration>,
    /// Reconnection settings.
    pub websocket: WebSocketSettings,
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let venue = VenueKind::default();
        Self {
            venue,
            url: venue.default_url().to_string(),
            symbols: vec![DEFAULT_SYMBOLS.to_string()],
            options: SubscribeOptions::default(),
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            heartbeat_interval: None,
            websocket: WebSocketSettings::default(),
            metrics_port: 9091,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unusable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown venue, an empty symbol list, or a
    /// zero depth or timeout.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let venue = match non_empty(&lookup, "BOOK_STREAM_VENUE") {
            Some(raw) => raw.parse::<VenueKind>().map_err(|reason| ConfigError::InvalidValue {
                key: "BOOK_STREAM_VENUE".to_string(),
                reason,
            })?,
            None => VenueKind::default(),
        };

        let url = non_empty(&lookup, "BOOK_STREAM_URL")
            .unwrap_or_else(|| venue.default_url().to_string());

        let symbols: Vec<Symbol> = non_empty(&lookup, "BOOK_STREAM_SYMBOLS")
            .unwrap_or_else(|| DEFAULT_SYMBOLS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if symbols.is_empty() {
            return Err(ConfigError::EmptyValue("BOOK_STREAM_SYMBOLS".to_string()));
        }

        let depth = match non_empty(&lookup, "BOOK_STREAM_DEPTH") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::InvalidValue {
                        key: "BOOK_STREAM_DEPTH".to_string(),
                        reason: format!("'{raw}' is not a positive integer"),
                    });
                }
                Ok(depth) => Some(depth),
            },
            None => None,
        };

        let options = SubscribeOptions {
            depth,
            contract_type: non_empty(&lookup, "BOOK_STREAM_CONTRACT_TYPE"),
        };

        let subscribe_timeout = parse_env_duration_millis(
            &lookup,
            "BOOK_STREAM_SUBSCRIBE_TIMEOUT_MS",
            defaults.subscribe_timeout,
        );
        if subscribe_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "BOOK_STREAM_SUBSCRIBE_TIMEOUT_MS".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }

        let heartbeat_interval = non_empty(&lookup, "BOOK_STREAM_HEARTBEAT_INTERVAL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let websocket = WebSocketSettings {
            reconnect_delay_initial: parse_env_duration_millis(
                &lookup,
                "BOOK_STREAM_RECONNECT_DELAY_INITIAL_MS",
                defaults.websocket.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                &lookup,
                "BOOK_STREAM_RECONNECT_DELAY_MAX_SECS",
                defaults.websocket.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env(
                &lookup,
                "BOOK_STREAM_RECONNECT_DELAY_MULTIPLIER",
                defaults.websocket.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_env(
                &lookup,
                "BOOK_STREAM_MAX_RECONNECT_ATTEMPTS",
                defaults.websocket.max_reconnect_attempts,
            ),
        };

        let metrics_port = parse_env(&lookup, "BOOK_STREAM_METRICS_PORT", defaults.metrics_port);

        Ok(Self {
            venue,
            url,
            symbols,
            options,
            subscribe_timeout,
            heartbeat_interval,
            websocket,
            metrics_port,
        })
    }

    /// Engine timing settings.
    #[must_use]
    pub const fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            subscribe_timeout: self.subscribe_timeout,
            heartbeat_interval: self.heartbeat_interval,
        }
    }

    /// Connector settings.
    #[must_use]
    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            url: self.url.clone(),
            reconnect: self.websocket.reconnect_config(),
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable holds an unusable value.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    non_empty(lookup, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    non_empty(lookup, key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    non_empty(lookup, key)
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
