//! OKEx v1 `addChannel` Dialect
//!
//! # Channels
//!
//! - spot: `ok_sub_spot_{base}_{quote}_depth[_{N}]`
//! - futures: `ok_sub_future{quote}_{base}_depth_{contract_type}[_{N}]`
//!
//! A channel ending in a numeric depth delivers complete `N`-level books;
//! a bare depth channel delivers diffs sequenced by the server timestamp.
//!
//! # Inbound
//!
//! A frame is one JSON object or an array of them:
//!
//! ```json
//! [{"binary":0,"channel":"addChannel","data":{"result":true,"channel":"ok_sub_spot_btc_usdt_depth"}}]
//! [{"binary":0,"channel":"ok_sub_spot_btc_usdt_depth","data":{"asks":[["7001","1"]],"bids":[],"timestamp":1546300800000}}]
//! {"event":"pong"}
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::levels::{parse_levels, parse_timestamp_millis};
use super::{FrameRule, classify, split_symbol};
use crate::application::ports::{DialectCapabilities, ResolveError, SymbolResolver, VenueProtocol};
use crate::domain::channel::ChannelBinding;
use crate::domain::frame::{BookPayload, InboundFrame, ProtocolError};
use crate::domain::order_book::IncrementalUpdate;
use crate::domain::subscription::{EventKind, SideFlags, SubscribeOptions, Symbol};

/// Default WebSocket endpoint.
pub const DEFAULT_URL: &str = "wss://real.okex.com:10441/websocket";

/// Keep-alive interval expected by the venue.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const SPOT_PREFIX: &str = "ok_sub_spot_";
const FUTURE_PREFIX: &str = "ok_sub_future";
const DEPTH_MARKER: &str = "_depth";

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct OkexMessage {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

impl OkexMessage {
    fn channel_is(&self, name: &str) -> bool {
        self.channel.as_deref() == Some(name)
    }

    fn result(&self) -> Option<bool> {
        self.data.get("result").and_then(Value::as_bool)
    }

    fn error_message(&self, fallback: &str) -> String {
        match (self.data.get("error_msg"), self.data.get("error_code")) {
            (Some(Value::String(msg)), _) => msg.clone(),
            (_, Some(code)) => format!("{fallback} (code {code})"),
            _ => fallback.to_string(),
        }
    }
}

const RULES: &[FrameRule<OkexMessage>] = &[
    FrameRule {
        name: "pong",
        matches: |m| m.channel.is_none(),
        classify: |_| Ok(InboundFrame::Pong),
    },
    FrameRule {
        name: "add_channel",
        matches: |m| m.channel_is("addChannel"),
        classify: classify_add_channel,
    },
    FrameRule {
        name: "remove_channel",
        matches: |m| m.channel_is("removeChannel"),
        classify: classify_remove_channel,
    },
    FrameRule {
        name: "channel_error",
        matches: |m| m.result() == Some(false),
        classify: |m| {
            Ok(InboundFrame::Error {
                channel: m.channel.clone(),
                message: m.error_message("orderbook error"),
            })
        },
    },
    FrameRule {
        name: "depth",
        matches: |m| m.channel.as_deref().is_some_and(is_depth_channel),
        classify: classify_depth,
    },
];

fn classify_add_channel(m: &OkexMessage) -> Result<InboundFrame, ProtocolError> {
    let channel = m
        .data
        .get("channel")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidFormat("addChannel without data.channel".into()))?
        .to_string();

    match m.result() {
        Some(true) => Ok(InboundFrame::SubscriptionAck {
            channel,
            sides: None,
        }),
        _ => Ok(InboundFrame::Error {
            channel: Some(channel),
            message: m.error_message("addChannel rejected"),
        }),
    }
}

fn classify_remove_channel(m: &OkexMessage) -> Result<InboundFrame, ProtocolError> {
    let channel = m
        .data
        .get("channel")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidFormat("removeChannel without data.channel".into()))?
        .to_string();

    if m.result() == Some(false) {
        return Ok(InboundFrame::Error {
            channel: Some(channel),
            message: m.error_message("removeChannel rejected"),
        });
    }
    Ok(InboundFrame::UnsubscribeAck { channel })
}

fn classify_depth(m: &OkexMessage) -> Result<InboundFrame, ProtocolError> {
    let channel = m.channel.clone().unwrap_or_default();
    let bids = parse_levels(m.data.get("bids"))?;
    let asks = parse_levels(m.data.get("asks"))?;
    let stamp = parse_timestamp_millis(m.data.get("timestamp"));

    let payload = if depth_levels(&channel).is_some() {
        BookPayload::Snapshot {
            bids,
            asks,
            sequence: stamp.map(|(millis, _)| millis),
            timestamp: stamp.map(|(_, at)| at),
        }
    } else {
        let (sequence, at) = stamp.ok_or_else(|| {
            ProtocolError::InvalidFormat(format!("depth diff on {channel} without timestamp"))
        })?;
        BookPayload::Incremental(IncrementalUpdate {
            bids,
            asks,
            sequence,
            timestamp: Some(at),
        })
    };

    Ok(InboundFrame::BookUpdate { channel, payload })
}

fn is_depth_channel(channel: &str) -> bool {
    (channel.starts_with(SPOT_PREFIX) || channel.starts_with(FUTURE_PREFIX))
        && channel.contains(DEPTH_MARKER)
}

/// Numeric depth suffix of a depth channel, if any.
fn depth_levels(channel: &str) -> Option<usize> {
    let (_, rest) = channel.split_once(DEPTH_MARKER)?;
    rest.rsplit('_').next()?.parse().ok()
}

// =============================================================================
// Protocol
// =============================================================================

/// OKEx v1 dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct OkexProtocol;

impl OkexProtocol {
    /// Create the dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn encode(event: &str, channel: &str) -> String {
        json!({ "event": event, "channel": channel }).to_string()
    }
}

impl SymbolResolver for OkexProtocol {
    fn channels_for(
        &self,
        symbol: &str,
        kind: EventKind,
        options: &SubscribeOptions,
    ) -> Result<Vec<ChannelBinding>, ResolveError> {
        if kind != EventKind::OrderBook {
            return Ok(Vec::new());
        }
        let (base, quote) =
            split_symbol(symbol).ok_or_else(|| ResolveError::InvalidSymbol(symbol.to_string()))?;
        let (base, quote) = (base.to_lowercase(), quote.to_lowercase());
        let depth = options.depth.map(|n| format!("_{n}")).unwrap_or_default();

        let channel = match options.contract_type.as_deref() {
            Some("") => {
                return Err(ResolveError::MissingOption {
                    symbol: symbol.to_string(),
                    option: "contract_type",
                });
            }
            Some(contract) => {
                format!("{FUTURE_PREFIX}{quote}_{base}{DEPTH_MARKER}_{contract}{depth}")
            }
            None => format!("{SPOT_PREFIX}{base}_{quote}{DEPTH_MARKER}{depth}"),
        };

        Ok(vec![ChannelBinding::new(
            channel,
            kind,
            symbol,
            SideFlags::BOTH,
        )])
    }

    fn symbol_for_channel(&self, channel: &str) -> Option<Symbol> {
        let (rest, future) = channel
            .strip_prefix(SPOT_PREFIX)
            .map(|r| (r, false))
            .or_else(|| channel.strip_prefix(FUTURE_PREFIX).map(|r| (r, true)))?;
        let (pair, _) = rest.split_once(DEPTH_MARKER)?;
        let (first, second) = pair.split_once('_')?;
        if first.is_empty() || second.is_empty() {
            return None;
        }

        let (base, quote) = if future { (second, first) } else { (first, second) };
        Some(format!("{}/{}", base.to_uppercase(), quote.to_uppercase()))
    }
}

impl VenueProtocol for OkexProtocol {
    fn name(&self) -> &'static str {
        "okex"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities {
            full_replace: false,
            snapshot: true,
            incremental: true,
            heartbeat: Some(HEARTBEAT_INTERVAL),
            acks_subscribe: true,
            acks_unsubscribe: true,
        }
    }

    fn encode_subscribe(&self, binding: &ChannelBinding) -> String {
        Self::encode("addChannel", &binding.channel)
    }

    fn encode_unsubscribe(&self, binding: &ChannelBinding) -> String {
        Self::encode("removeChannel", &binding.channel)
    }

    fn encode_heartbeat(&self) -> Option<String> {
        Some(json!({ "event": "ping" }).to_string())
    }

    fn decode(&self, raw: &str) -> Result<Vec<InboundFrame>, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        let messages = match value {
            Value::Array(items) => items,
            object @ Value::Object(_) => vec![object],
            other => {
                return Err(ProtocolError::InvalidFormat(format!(
                    "expected object or array, got {other}"
                )));
            }
        };

        messages
            .into_iter()
            .map(|item| {
                let message: OkexMessage = serde_json::from_value(item)?;
                classify(RULES, &message)
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
