//! Inbound Frame Classification
//!
//! Venue-neutral representation of decoded inbound messages. Each dialect
//! decodes raw text into zero or more [`InboundFrame`]s; the dispatcher only
//! ever sees these.

use chrono::{DateTime, Utc};

use super::channel::ChannelId;
use super::order_book::{BookSide, IncrementalUpdate, PriceLevel};
use super::subscription::SideFlags;

// =============================================================================
// Frames
// =============================================================================

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Venue confirmed a subscription on a channel.
    SubscriptionAck {
        /// Acknowledged channel.
        channel: ChannelId,
        /// Side flags the ack satisfies, when the dialect knows them.
        sides: Option<SideFlags>,
    },
    /// Venue confirmed an unsubscribe on a channel.
    UnsubscribeAck {
        /// Released channel.
        channel: ChannelId,
    },
    /// Depth data for a channel.
    BookUpdate {
        /// Source channel.
        channel: ChannelId,
        /// Decoded payload.
        payload: BookPayload,
    },
    /// Venue reported an error.
    Error {
        /// Channel the error refers to, if any.
        channel: Option<ChannelId>,
        /// Venue message.
        message: String,
    },
    /// Keep-alive response.
    Pong,
    /// Recognised but irrelevant (connection banners, control events).
    Ignored,
}

impl InboundFrame {
    /// Short frame type name for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SubscriptionAck { .. } => "ack",
            Self::UnsubscribeAck { .. } => "unsub_ack",
            Self::BookUpdate { .. } => "book",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
            Self::Ignored => "ignored",
        }
    }
}

/// Shape of a depth payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookPayload {
    /// One side replaced wholesale.
    Side {
        /// Replaced side.
        side: BookSide,
        /// New levels.
        levels: Vec<PriceLevel>,
    },
    /// Both sides replaced.
    Snapshot {
        /// Bid levels.
        bids: Vec<PriceLevel>,
        /// Ask levels.
        asks: Vec<PriceLevel>,
        /// Sequence marker, when the venue sends one.
        sequence: Option<u64>,
        /// Server timestamp.
        timestamp: Option<DateTime<Utc>>,
    },
    /// Diff against the current book.
    Incremental(IncrementalUpdate),
}

impl BookPayload {
    /// Short payload shape name.
    #[must_use]
    pub const fn shape(&self) -> &'static str {
        match self {
            Self::Side { .. } => "full_replace",
            Self::Snapshot { .. } => "snapshot",
            Self::Incremental(_) => "incremental",
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Malformed or unexpected inbound payload.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Payload is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload is JSON but not a recognised message.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    /// A price level could not be parsed.
    #[error("invalid price level: {0}")]
    InvalidLevel(String),

    /// Payload shape not allowed by the active dialect.
    #[error("{shape} payload not supported by {venue}")]
    UnsupportedPayload {
        /// Payload shape.
        shape: &'static str,
        /// Venue dialect name.
        venue: &'static str,
    },

    /// Data for a channel that maps to no symbol.
    #[error("no symbol for channel {0}")]
    UnknownChannel(ChannelId),
}

impl ProtocolError {
    /// Error category label for metrics.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::InvalidFormat(_) => "format",
            Self::InvalidLevel(_) => "level",
            Self::UnsupportedPayload { .. } => "unsupported_payload",
            Self::UnknownChannel(_) => "unknown_channel",
        }
    }
}
