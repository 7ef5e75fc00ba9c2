//! Subscription Types
//!
//! Domain types describing what a caller asks a venue to stream and how far
//! that request has progressed.
//!
//! # Design
//!
//! A subscription is identified by a [`SubscriptionKey`] (event kind +
//! symbol). Several requests for the same key may be in flight at once, each
//! told apart by its caller-chosen [`Nonce`]. Venues that stream the two book
//! sides on separate channels acknowledge each side independently, which is
//! what [`SideFlags`] tracks.

use std::fmt;

// =============================================================================
// Types
// =============================================================================

/// A unified symbol string (`BASE/QUOTE`, e.g. `BTC/USD`).
pub type Symbol = String;

/// Caller-chosen correlation token matching a request to its acks.
pub type Nonce = u64;

/// Kind of market data event a caller can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// Level-2 order book.
    OrderBook,
    /// Public trades.
    Trades,
    /// Ticker.
    Ticker,
}

impl EventKind {
    /// Get all event kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::OrderBook, Self::Trades, Self::Ticker]
    }

    /// Parse an event kind from its wire name (`ob`, `trade`, `ticker`).
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "ob" => Some(Self::OrderBook),
            "trade" | "trades" => Some(Self::Trades),
            "ticker" => Some(Self::Ticker),
            _ => None,
        }
    }

    /// Get the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrderBook => "ob",
            Self::Trades => "trade",
            Self::Ticker => "ticker",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Side Flags
// =============================================================================

/// Set of independently acknowledged book sides.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SideFlags(u8);

impl SideFlags {
    /// No side.
    pub const NONE: Self = Self(0);
    /// Buy (bid) side.
    pub const BUY: Self = Self(0b01);
    /// Sell (ask) side.
    pub const SELL: Self = Self(0b10);
    /// Both sides.
    pub const BOTH: Self = Self(0b11);

    /// Check if every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two flag sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Set every flag in `other`.
    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Check if no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for SideFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("NONE"),
            Self::BUY => f.write_str("BUY"),
            Self::SELL => f.write_str("SELL"),
            _ => f.write_str("BUY|SELL"),
        }
    }
}

// =============================================================================
// Subscription Intent
// =============================================================================

/// Venue-specific subscription options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum number of levels per side handed to consumers.
    pub depth: Option<usize>,
    /// Futures contract type (`this_week`, `next_week`, `quarter`).
    pub contract_type: Option<String>,
}

impl SubscribeOptions {
    /// Set the depth limit.
    #[must_use]
    pub const fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Set the futures contract type.
    #[must_use]
    pub fn with_contract_type(mut self, contract_type: impl Into<String>) -> Self {
        self.contract_type = Some(contract_type.into());
        self
    }
}

/// Identifies one logical subscription within a connection context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Event kind.
    pub kind: EventKind,
    /// Unified symbol.
    pub symbol: Symbol,
}

impl SubscriptionKey {
    /// Create a new key.
    #[must_use]
    pub fn new(kind: EventKind, symbol: impl Into<Symbol>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.symbol)
    }
}

/// A single subscribe or unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionIntent {
    /// Event kind.
    pub kind: EventKind,
    /// Unified symbol.
    pub symbol: Symbol,
    /// Correlation nonce.
    pub nonce: Nonce,
    /// Venue-specific options.
    pub options: SubscribeOptions,
}

impl SubscriptionIntent {
    /// Create an intent with default options.
    #[must_use]
    pub fn new(kind: EventKind, symbol: impl Into<Symbol>, nonce: Nonce) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
            nonce,
            options: SubscribeOptions::default(),
        }
    }

    /// Shorthand for an order-book intent.
    #[must_use]
    pub fn order_book(symbol: impl Into<Symbol>, nonce: Nonce) -> Self {
        Self::new(EventKind::OrderBook, symbol, nonce)
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: SubscribeOptions) -> Self {
        self.options = options;
        self
    }

    /// Get the subscription key.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.kind, self.symbol.clone())
    }
}

// =============================================================================
// Subscription Phase
// =============================================================================

/// Lifecycle phase of a subscription key.
///
/// `Subscribing` is the only phase with a live timeout timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionPhase {
    /// No subscription and nothing pending.
    #[default]
    Unsubscribed,
    /// At least one request awaiting acknowledgment.
    Subscribing,
    /// Every required side acknowledged.
    Subscribed,
}

impl SubscriptionPhase {
    /// Get the phase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Subscribing => "subscribing",
            Self::Subscribed => "subscribed",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
