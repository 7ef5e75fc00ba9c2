//! Venue Dialects
//!
//! Concrete implementations of [`VenueProtocol`]:
//!
//! - [`okex::OkexProtocol`]: `addChannel`/`removeChannel` dialect with a
//!   30 s ping keep-alive, depth-N snapshots and sequenced depth diffs
//! - [`liquid::LiquidProtocol`]: Pusher dialect streaming each book side on
//!   its own price-ladder channel
//!
//! Inbound classification in both dialects is an ordered [`FrameRule`]
//! table: the first rule whose predicate matches decides the frame type.

pub mod levels;
pub mod liquid;
pub mod okex;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::application::ports::VenueProtocol;
use crate::domain::frame::{InboundFrame, ProtocolError};

// =============================================================================
// Classification Tables
// =============================================================================

/// One entry of a dialect's ordered classification table.
pub struct FrameRule<M> {
    /// Rule name for logs and tests.
    pub name: &'static str,
    /// Predicate selecting messages this rule handles.
    pub matches: fn(&M) -> bool,
    /// Conversion into a classified frame.
    pub classify: fn(&M) -> Result<InboundFrame, ProtocolError>,
}

/// Classify `message` by the first matching rule. Unmatched messages are
/// [`InboundFrame::Ignored`].
///
/// # Errors
///
/// Returns the matching rule's conversion error.
pub fn classify<M>(rules: &[FrameRule<M>], message: &M) -> Result<InboundFrame, ProtocolError> {
    rules
        .iter()
        .find(|rule| (rule.matches)(message))
        .map_or(Ok(InboundFrame::Ignored), |rule| {
            tracing::trace!(rule = rule.name, "Frame classified");
            (rule.classify)(message)
        })
}

/// Split a unified `BASE/QUOTE` symbol.
pub(crate) fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (base, quote) = symbol.split_once('/')?;
    (!base.is_empty() && !quote.is_empty() && !quote.contains('/')).then_some((base, quote))
}

// =============================================================================
// Venue Selection
// =============================================================================

/// Supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VenueKind {
    /// OKEx v1 `addChannel` dialect.
    #[default]
    Okex,
    /// Liquid Pusher dialect.
    Liquid,
}

impl VenueKind {
    /// Venue name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Okex => "okex",
            Self::Liquid => "liquid",
        }
    }

    /// Default WebSocket endpoint.
    #[must_use]
    pub const fn default_url(self) -> &'static str {
        match self {
            Self::Okex => okex::DEFAULT_URL,
            Self::Liquid => liquid::DEFAULT_URL,
        }
    }

    /// Build the dialect. `markets` seeds channel-to-symbol recovery for
    /// dialects whose channel ids drop the symbol separator.
    #[must_use]
    pub fn protocol(self, markets: &[String]) -> Arc<dyn VenueProtocol> {
        match self {
            Self::Okex => Arc::new(okex::OkexProtocol::new()),
            Self::Liquid => Arc::new(liquid::LiquidProtocol::new().with_markets(markets)),
        }
    }
}

impl fmt::Display for VenueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VenueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "okex" | "okx" => Ok(Self::Okex),
            "liquid" | "pusher" => Ok(Self::Liquid),
            other => Err(format!("unknown venue '{other}', expected okex or liquid")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("okex", VenueKind::Okex ; "okex")]
    #[test_case("OKX", VenueKind::Okex ; "okx alias")]
    #[test_case(" liquid ", VenueKind::Liquid ; "liquid trimmed")]
    fn venue_from_str(input: &str, expected: VenueKind) {
        assert_eq!(input.parse::<VenueKind>().unwrap(), expected);
    }

    #[test]
    fn unknown_venue_rejected() {
        assert!("binance".parse::<VenueKind>().is_err());
    }

    #[test_case("BTC/USD", Some(("BTC", "USD")) ; "pair")]
    #[test_case("BTCUSD", None ; "no separator")]
    #[test_case("/USD", None ; "empty base")]
    #[test_case("A/B/C", None ; "two separators")]
    fn symbol_split(symbol: &str, expected: Option<(&str, &str)>) {
        assert_eq!(split_symbol(symbol), expected);
    }

    #[test]
    fn unmatched_message_is_ignored() {
        let rules: [FrameRule<u8>; 1] = [FrameRule {
            name: "seven",
            matches: |m| *m == 7,
            classify: |_| Ok(InboundFrame::Pong),
        }];

        assert_eq!(classify(&rules, &7).unwrap(), InboundFrame::Pong);
        assert_eq!(classify(&rules, &1).unwrap(), InboundFrame::Ignored);
    }

    #[test]
    fn protocol_names_match_kind() {
        assert_eq!(VenueKind::Okex.protocol(&[]).name(), "okex");
        assert_eq!(VenueKind::Liquid.protocol(&[]).name(), "liquid");
    }
}
