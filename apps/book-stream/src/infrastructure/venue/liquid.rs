//! Liquid Pusher Dialect
//!
//! Each book side streams on its own channel,
//! `price_ladders_cash_{base}{quote}_{buy|sell}`, and every update replaces
//! that side wholesale. The two side channels are acknowledged
//! independently, so a subscription completes only once both are.
//!
//! Pusher wraps payloads in an envelope whose `data` is often a JSON
//! string holding the real payload:
//!
//! ```json
//! {"event":"pusher_internal:subscription_succeeded","channel":"price_ladders_cash_btcusd_buy","data":"{}"}
//! {"event":"updated","channel":"price_ladders_cash_btcusd_sell","data":"[[\"7001.5\",\"0.25\"]]"}
//! ```

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Value, json};

use super::levels::parse_levels;
use super::{FrameRule, classify, split_symbol};
use crate::application::ports::{DialectCapabilities, ResolveError, SymbolResolver, VenueProtocol};
use crate::domain::channel::ChannelBinding;
use crate::domain::frame::{BookPayload, InboundFrame, ProtocolError};
use crate::domain::order_book::BookSide;
use crate::domain::subscription::{EventKind, SideFlags, SubscribeOptions, Symbol};

/// Default Pusher endpoint.
pub const DEFAULT_URL: &str = "wss://ws.pusherapp.com/app/2ff981bb060680b5ce97?protocol=7";

const LADDER_PREFIX: &str = "price_ladders_cash_";

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Deserialize)]
struct PusherMessage {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

impl PusherMessage {
    fn is_ladder(&self) -> bool {
        self.channel
            .as_deref()
            .is_some_and(|c| c.starts_with(LADDER_PREFIX))
    }

    /// Envelope data, with string-encoded JSON unwrapped.
    fn payload(&self) -> Result<Value, ProtocolError> {
        match &self.data {
            Value::String(inner) => Ok(serde_json::from_str(inner)?),
            other => Ok(other.clone()),
        }
    }

    fn required_channel(&self) -> Result<String, ProtocolError> {
        self.channel
            .clone()
            .ok_or_else(|| ProtocolError::InvalidFormat(format!("{} without channel", self.event)))
    }
}

const RULES: &[FrameRule<PusherMessage>] = &[
    FrameRule {
        name: "subscription_succeeded",
        matches: |m| {
            m.event == "pusher_internal:subscription_succeeded" || m.event == "subscription_succeeded"
        },
        classify: |m| {
            let channel = m.required_channel()?;
            let sides = ladder_side(&channel).map(|(_, flags)| flags);
            Ok(InboundFrame::SubscriptionAck { channel, sides })
        },
    },
    FrameRule {
        name: "ladder_update",
        matches: |m| m.event == "updated" && m.is_ladder(),
        classify: classify_ladder,
    },
    FrameRule {
        name: "error",
        matches: |m| m.event == "pusher:error",
        classify: |m| {
            let message = match &m.data {
                Value::String(s) => s.clone(),
                data => data
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| data.to_string(), str::to_string),
            };
            Ok(InboundFrame::Error {
                channel: m.channel.clone(),
                message,
            })
        },
    },
    FrameRule {
        name: "pong",
        matches: |m| m.event == "pusher:pong",
        classify: |_| Ok(InboundFrame::Pong),
    },
    FrameRule {
        name: "pusher_control",
        matches: |m| m.event.starts_with("pusher:") || m.event.starts_with("pusher_internal:"),
        classify: |_| Ok(InboundFrame::Ignored),
    },
];

fn classify_ladder(m: &PusherMessage) -> Result<InboundFrame, ProtocolError> {
    let channel = m.required_channel()?;
    let (side, _) = ladder_side(&channel)
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("no book side in {channel}")))?;
    let payload = m.payload()?;
    let levels = parse_levels(Some(&payload))?;

    Ok(InboundFrame::BookUpdate {
        channel,
        payload: BookPayload::Side { side, levels },
    })
}

fn ladder_side(channel: &str) -> Option<(BookSide, SideFlags)> {
    let rest = channel.strip_prefix(LADDER_PREFIX)?;
    if rest.ends_with("_buy") {
        Some((BookSide::Bids, SideFlags::BUY))
    } else if rest.ends_with("_sell") {
        Some((BookSide::Asks, SideFlags::SELL))
    } else {
        None
    }
}

fn market_id(base: &str, quote: &str) -> String {
    format!("{base}{quote}").to_lowercase()
}

// =============================================================================
// Protocol
// =============================================================================

/// Liquid Pusher dialect.
#[derive(Debug, Clone, Default)]
pub struct LiquidProtocol {
    markets: HashMap<String, Symbol>,
}

impl LiquidProtocol {
    /// Create the dialect with no known markets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register markets so their channel ids map back to unified symbols.
    #[must_use]
    pub fn with_markets(mut self, symbols: &[String]) -> Self {
        for symbol in symbols {
            if let Some((base, quote)) = split_symbol(symbol) {
                self.markets.insert(market_id(base, quote), symbol.clone());
            }
        }
        self
    }

    fn encode(event: &str, channel: &str) -> String {
        json!({ "event": event, "data": { "channel": channel } }).to_string()
    }
}

impl SymbolResolver for LiquidProtocol {
    fn channels_for(
        &self,
        symbol: &str,
        kind: EventKind,
        _options: &SubscribeOptions,
    ) -> Result<Vec<ChannelBinding>, ResolveError> {
        if kind != EventKind::OrderBook {
            return Ok(Vec::new());
        }
        let (base, quote) =
            split_symbol(symbol).ok_or_else(|| ResolveError::InvalidSymbol(symbol.to_string()))?;
        let id = market_id(base, quote);

        Ok(vec![
            ChannelBinding::new(
                format!("{LADDER_PREFIX}{id}_buy"),
                kind,
                symbol,
                SideFlags::BUY,
            ),
            ChannelBinding::new(
                format!("{LADDER_PREFIX}{id}_sell"),
                kind,
                symbol,
                SideFlags::SELL,
            ),
        ])
    }

    fn symbol_for_channel(&self, channel: &str) -> Option<Symbol> {
        let rest = channel.strip_prefix(LADDER_PREFIX)?;
        let (id, _) = rest.rsplit_once('_')?;
        Some(self.markets.get(id).cloned().unwrap_or_else(|| id.to_string()))
    }
}

impl VenueProtocol for LiquidProtocol {
    fn name(&self) -> &'static str {
        "liquid"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities {
            full_replace: true,
            snapshot: false,
            incremental: false,
            heartbeat: None,
            acks_subscribe: true,
            acks_unsubscribe: false,
        }
    }

    fn encode_subscribe(&self, binding: &ChannelBinding) -> String {
        Self::encode("pusher:subscribe", &binding.channel)
    }

    fn encode_unsubscribe(&self, binding: &ChannelBinding) -> String {
        Self::encode("pusher:unsubscribe", &binding.channel)
    }

    fn encode_heartbeat(&self) -> Option<String> {
        Some(json!({ "event": "pusher:ping", "data": {} }).to_string())
    }

    fn decode(&self, raw: &str) -> Result<Vec<InboundFrame>, ProtocolError> {
        let message: PusherMessage = serde_json::from_str(raw)?;
        Ok(vec![classify(RULES, &message)?])
    }
}

// =============================================================================
// Tests
// =============================================================================
