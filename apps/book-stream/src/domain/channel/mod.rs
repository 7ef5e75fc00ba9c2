//! Channel Map
//!
//! Bidirectional mapping between venue channel ids and the subscription
//! they carry. A single subscription key may own several channels (one per
//! independently acknowledged book side).

use std::collections::HashMap;

use super::subscription::{EventKind, SideFlags, Symbol, SubscriptionKey};

/// Venue-assigned channel identifier.
pub type ChannelId = String;

/// One venue channel and what its traffic means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding {
    /// Venue channel id.
    pub channel: ChannelId,
    /// Event kind carried.
    pub kind: EventKind,
    /// Unified symbol carried.
    pub symbol: Symbol,
    /// Side flags an ack on this channel satisfies.
    pub sides: SideFlags,
}

impl ChannelBinding {
    /// Create a new binding.
    #[must_use]
    pub fn new(
        channel: impl Into<ChannelId>,
        kind: EventKind,
        symbol: impl Into<Symbol>,
        sides: SideFlags,
    ) -> Self {
        Self {
            channel: channel.into(),
            kind,
            symbol: symbol.into(),
            sides,
        }
    }

    /// Get the owning subscription key.
    #[must_use]
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey::new(self.kind, self.symbol.clone())
    }
}

/// Channel id to binding map, indexed both ways.
#[derive(Debug, Default)]
pub struct ChannelMap {
    by_channel: HashMap<ChannelId, ChannelBinding>,
    by_key: HashMap<SubscriptionKey, Vec<ChannelId>>,
}

impl ChannelMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding.
    ///
    /// Re-registering a channel replaces its previous binding, detaching it
    /// from the key it belonged to.
    pub fn insert(&mut self, binding: ChannelBinding) {
        let key = binding.key();
        let channel = binding.channel.clone();

        if let Some(previous) = self.by_channel.insert(channel.clone(), binding) {
            let previous_key = previous.key();
            if previous_key != key {
                self.detach(&previous_key, &channel);
            }
        }

        let channels = self.by_key.entry(key).or_default();
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }

    fn detach(&mut self, key: &SubscriptionKey, channel: &str) {
        if let Some(channels) = self.by_key.get_mut(key) {
            channels.retain(|c| c != channel);
            if channels.is_empty() {
                self.by_key.remove(key);
            }
        }
    }

    /// Get the binding for a channel.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<&ChannelBinding> {
        self.by_channel.get(channel)
    }

    /// Get the symbol a channel carries.
    #[must_use]
    pub fn symbol_for(&self, channel: &str) -> Option<&Symbol> {
        self.by_channel.get(channel).map(|b| &b.symbol)
    }

    /// Get the channels owned by a subscription key.
    #[must_use]
    pub fn channels_for(&self, key: &SubscriptionKey) -> &[ChannelId] {
        self.by_key.get(key).map_or(&[], Vec::as_slice)
    }

    /// Check if a channel is registered.
    #[must_use]
    pub fn contains(&self, channel: &str) -> bool {
        self.by_channel.contains_key(channel)
    }

    /// Remove every channel owned by a key, returning the removed bindings.
    pub fn remove_key(&mut self, key: &SubscriptionKey) -> Vec<ChannelBinding> {
        self.by_key
            .remove(key)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|channel| self.by_channel.remove(&channel))
            .collect()
    }

    /// Drop every binding.
    pub fn clear(&mut self) {
        self.by_channel.clear();
        self.by_key.clear();
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    /// Check if no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn side(channel: &str, symbol: &str, sides: SideFlags) -> ChannelBinding {
        ChannelBinding::new(channel, EventKind::OrderBook, symbol, sides)
    }

    #[test]
    fn lookup_both_directions() {
        let mut map = ChannelMap::new();
        map.insert(side("ladder_btcusd_buy", "BTC/USD", SideFlags::BUY));
        map.insert(side("ladder_btcusd_sell", "BTC/USD", SideFlags::SELL));

        let key = SubscriptionKey::new(EventKind::OrderBook, "BTC/USD");
        assert_eq!(map.channels_for(&key).len(), 2);
        assert_eq!(
            map.symbol_for("ladder_btcusd_sell").map(String::as_str),
            Some("BTC/USD")
        );
        assert_eq!(map.get("ladder_btcusd_buy").unwrap().sides, SideFlags::BUY);
    }

    #[test]
    fn insert_is_idempotent() {
        let mut map = ChannelMap::new();
        map.insert(side("ch", "BTC/USD", SideFlags::BOTH));
        map.insert(side("ch", "BTC/USD", SideFlags::BOTH));

        let key = SubscriptionKey::new(EventKind::OrderBook, "BTC/USD");
        assert_eq!(map.len(), 1);
        assert_eq!(map.channels_for(&key), ["ch".to_string()]);
    }

    #[test]
    fn rebinding_moves_channel_between_keys() {
        let mut map = ChannelMap::new();
        map.insert(side("ch", "BTC/USD", SideFlags::BOTH));
        map.insert(side("ch", "ETH/USD", SideFlags::BOTH));

        let btc = SubscriptionKey::new(EventKind::OrderBook, "BTC/USD");
        let eth = SubscriptionKey::new(EventKind::OrderBook, "ETH/USD");
        assert!(map.channels_for(&btc).is_empty());
        assert_eq!(map.channels_for(&eth).len(), 1);
    }

    #[test]
    fn remove_key_drops_all_channels() {
        let mut map = ChannelMap::new();
        map.insert(side("a", "BTC/USD", SideFlags::BUY));
        map.insert(side("b", "BTC/USD", SideFlags::SELL));
        map.insert(side("c", "ETH/USD", SideFlags::BOTH));

        let removed = map.remove_key(&SubscriptionKey::new(EventKind::OrderBook, "BTC/USD"));

        assert_eq!(removed.len(), 2);
        assert!(!map.contains("a"));
        assert!(!map.contains("b"));
        assert!(map.contains("c"));
    }
}
