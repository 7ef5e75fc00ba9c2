//! Port Interfaces
//!
//! Defines the interfaces (ports) between the engine and the outside world
//! following the Hexagonal Architecture pattern. Infrastructure adapters
//! implement these contracts.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`]: writes encoded frames to a connection
//! - [`SymbolResolver`]: maps unified symbols to venue channels and back
//! - [`VenueProtocol`]: a venue dialect (resolver + wire codec + capabilities)
//! - [`EventSink`]: receives book updates and connection notifications

use std::time::Duration;

use tokio::sync::mpsc;

use crate::domain::channel::ChannelBinding;
use crate::domain::connection::ContextId;
use crate::domain::frame::{InboundFrame, ProtocolError};
use crate::domain::order_book::OrderBookState;
use crate::domain::subscription::{EventKind, SubscribeOptions, Symbol};

// =============================================================================
// Transport
// =============================================================================

/// Outbound side of the raw duplex transport.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Queue an encoded frame on a context's connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or unknown.
    fn send(&self, context: ContextId, frame: String) -> Result<(), TransportError>;
}

/// Transport write failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection already closed.
    #[error("connection closed")]
    Closed,

    /// No connection registered for the context.
    #[error("unknown connection context {0}")]
    UnknownContext(ContextId),
}

// =============================================================================
// Symbol Resolution
// =============================================================================

/// Maps unified symbols to venue channels.
pub trait SymbolResolver: Send + Sync {
    /// Resolve the channels carrying `kind` for `symbol`, one per
    /// independently acknowledged side.
    ///
    /// # Errors
    ///
    /// Returns an error if the symbol or options cannot be mapped.
    fn channels_for(
        &self,
        symbol: &str,
        kind: EventKind,
        options: &SubscribeOptions,
    ) -> Result<Vec<ChannelBinding>, ResolveError>;

    /// Recover the unified symbol from a channel id.
    fn symbol_for_channel(&self, channel: &str) -> Option<Symbol>;
}

/// Symbol resolution failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// Symbol is not in `BASE/QUOTE` form.
    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    /// A required option was not supplied.
    #[error("{symbol} requires option {option}")]
    MissingOption {
        /// Requested symbol.
        symbol: String,
        /// Missing option name.
        option: &'static str,
    },
}

// =============================================================================
// Venue Protocol
// =============================================================================

/// Capability set of a venue dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct DialectCapabilities {
    /// Venue replaces one side wholesale.
    pub full_replace: bool,
    /// Venue sends complete two-sided books.
    pub snapshot: bool,
    /// Venue sends sequenced diffs.
    pub incremental: bool,
    /// Keep-alive interval, if the venue requires one.
    pub heartbeat: Option<Duration>,
    /// Venue acknowledges subscribe requests.
    pub acks_subscribe: bool,
    /// Venue acknowledges unsubscribe requests.
    pub acks_unsubscribe: bool,
}

/// A venue wire dialect.
pub trait VenueProtocol: SymbolResolver {
    /// Venue name used in logs and metric labels.
    fn name(&self) -> &'static str;

    /// Capability set.
    fn capabilities(&self) -> DialectCapabilities;

    /// Check if the dialect streams an event kind.
    fn supports(&self, kind: EventKind) -> bool {
        kind == EventKind::OrderBook
    }

    /// Encode a subscribe request for one channel.
    fn encode_subscribe(&self, binding: &ChannelBinding) -> String;

    /// Encode an unsubscribe request for one channel.
    fn encode_unsubscribe(&self, binding: &ChannelBinding) -> String;

    /// Encode a keep-alive frame, if the dialect has one.
    fn encode_heartbeat(&self) -> Option<String>;

    /// Decode raw inbound text into classified frames.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed.
    fn decode(&self, raw: &str) -> Result<Vec<InboundFrame>, ProtocolError>;
}

// =============================================================================
// Event Sink
// =============================================================================

/// Notification pushed to engine consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A symbol's book changed.
    BookUpdated {
        /// Source context.
        context: ContextId,
        /// Unified symbol.
        symbol: Symbol,
        /// Depth-limited snapshot after the update.
        snapshot: OrderBookState,
    },
    /// An inbound payload could not be handled.
    ProtocolError {
        /// Source context.
        context: ContextId,
        /// Error category.
        category: &'static str,
        /// Error description.
        message: String,
    },
    /// The venue reported an error.
    VenueError {
        /// Source context.
        context: ContextId,
        /// Channel the error refers to, if any.
        channel: Option<String>,
        /// Venue message.
        message: String,
    },
    /// The context was torn down.
    Closed {
        /// Source context.
        context: ContextId,
    },
}

/// Receives engine notifications.
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: EngineEvent);
}

impl EventSink for mpsc::UnboundedSender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        // Receiver gone means nobody is listening
        let _ = self.send(event);
    }
}
