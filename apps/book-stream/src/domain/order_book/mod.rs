//! Order-Book Store
//!
//! Per-symbol order-book state maintained from venue depth updates.
//!
//! # Design
//!
//! Each side is stored as a price-keyed `BTreeMap` so that every merge keeps
//! the ladder ordered. Consumers never see the maps: [`OrderBookStore::clone_book`]
//! copies the best levels of each side into an owned [`OrderBookState`], so
//! mutating a snapshot cannot affect stored state.
//!
//! Venues deliver depth in three shapes:
//! - one side replaced wholesale (price ladders streamed per side)
//! - both sides replaced at once (depth-N snapshots)
//! - incremental diffs carrying a sequence marker, where size zero removes a level

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::subscription::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Order book side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    /// Buy side, best (highest) price first.
    Bids,
    /// Sell side, best (lowest) price first.
    Asks,
}

impl BookSide {
    /// Get the side name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bids => "bids",
            Self::Asks => "asks",
        }
    }
}

/// A single aggregated price level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Level price.
    pub price: Decimal,
    /// Aggregate size resting at the price.
    pub size: Decimal,
}

impl PriceLevel {
    /// Create a new price level.
    #[must_use]
    pub const fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }
}

/// Immutable snapshot of one symbol's book.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderBookState {
    /// Bid levels, descending by price.
    pub bids: Vec<PriceLevel>,
    /// Ask levels, ascending by price.
    pub asks: Vec<PriceLevel>,
    /// Time of the last applied update.
    pub timestamp: Option<DateTime<Utc>>,
    /// Sequence marker of the last applied incremental update or snapshot.
    pub nonce: Option<u64>,
    /// Depth limit registered for the symbol.
    pub depth_limit: Option<usize>,
}

impl OrderBookState {
    /// Best bid level.
    #[must_use]
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    /// Best ask level.
    #[must_use]
    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    /// Check if both sides are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Diff-style update covering both sides.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IncrementalUpdate {
    /// Bid changes (size zero removes the level).
    pub bids: Vec<PriceLevel>,
    /// Ask changes (size zero removes the level).
    pub asks: Vec<PriceLevel>,
    /// Server sequence marker, strictly increasing.
    pub sequence: u64,
    /// Server timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Result of applying an incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update was merged.
    Applied,
    /// The update's marker did not advance past the last applied one.
    Stale {
        /// Last applied marker.
        last: u64,
        /// Rejected marker.
        received: u64,
    },
}

impl ApplyOutcome {
    /// Check if the update was merged.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

// =============================================================================
// Ladder
// =============================================================================

/// One side of a book, keyed by price.
#[derive(Debug, Default, Clone)]
struct Ladder {
    levels: BTreeMap<Decimal, Decimal>,
}

impl Ladder {
    /// Replace all levels. Zero-size levels are not stored.
    fn replace(&mut self, levels: &[PriceLevel]) {
        self.levels.clear();
        self.merge(levels);
    }

    /// Upsert levels; size zero removes.
    fn merge(&mut self, levels: &[PriceLevel]) {
        for level in levels {
            if level.size.is_zero() {
                self.levels.remove(&level.price);
            } else {
                self.levels.insert(level.price, level.size);
            }
        }
    }

    /// Best `depth` levels for the given side, best first.
    fn best(&self, side: BookSide, depth: Option<usize>) -> Vec<PriceLevel> {
        let take = depth.unwrap_or(usize::MAX);
        let to_level = |(price, size): (&Decimal, &Decimal)| PriceLevel::new(*price, *size);

        match side {
            BookSide::Bids => self.levels.iter().rev().take(take).map(to_level).collect(),
            BookSide::Asks => self.levels.iter().take(take).map(to_level).collect(),
        }
    }
}

/// Live mutable state for one symbol.
#[derive(Debug, Default, Clone)]
struct BookEntry {
    bids: Ladder,
    asks: Ladder,
    timestamp: Option<DateTime<Utc>>,
    nonce: Option<u64>,
    depth_limit: Option<usize>,
}

impl BookEntry {
    const fn ladder_mut(&mut self, side: BookSide) -> &mut Ladder {
        match side {
            BookSide::Bids => &mut self.bids,
            BookSide::Asks => &mut self.asks,
        }
    }

    fn snapshot(&self, depth: Option<usize>) -> OrderBookState {
        OrderBookState {
            bids: self.bids.best(BookSide::Bids, depth),
            asks: self.asks.best(BookSide::Asks, depth),
            timestamp: self.timestamp,
            nonce: self.nonce,
            depth_limit: self.depth_limit,
        }
    }
}

// =============================================================================
// Order Book Store
// =============================================================================

/// Order books for every symbol of one connection context.
///
/// # Example
///
/// ```rust
/// use book_stream::domain::order_book::{BookSide, OrderBookStore, PriceLevel};
/// use rust_decimal::Decimal;
///
/// let mut store = OrderBookStore::new();
/// store.apply_full_replace(
///     "BTC/USD",
///     BookSide::Bids,
///     &[PriceLevel::new(Decimal::from(100), Decimal::ONE)],
/// );
///
/// let book = store.clone_book("BTC/USD", None).unwrap();
/// assert_eq!(book.bids.len(), 1);
/// assert!(book.asks.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct OrderBookStore {
    books: HashMap<Symbol, BookEntry>,
}

impl OrderBookStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, symbol: &str) -> &mut BookEntry {
        self.books.entry(symbol.to_string()).or_default()
    }

    /// Replace one side wholesale, leaving the other side untouched.
    pub fn apply_full_replace(&mut self, symbol: &str, side: BookSide, levels: &[PriceLevel]) {
        let entry = self.entry(symbol);
        entry.ladder_mut(side).replace(levels);
        entry.timestamp = Some(Utc::now());
    }

    /// Replace both sides at once.
    ///
    /// The sequence marker is reset to the snapshot's marker so that a venue
    /// that restarted its sequence is corrected by a full update.
    pub fn apply_snapshot(
        &mut self,
        symbol: &str,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        sequence: Option<u64>,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let entry = self.entry(symbol);
        entry.bids.replace(bids);
        entry.asks.replace(asks);
        entry.nonce = sequence;
        entry.timestamp = Some(timestamp.unwrap_or_else(Utc::now));
    }

    /// Merge a diff update covering both sides.
    ///
    /// Updates whose marker is not greater than the last applied one are
    /// rejected without touching state.
    pub fn apply_incremental(&mut self, symbol: &str, update: &IncrementalUpdate) -> ApplyOutcome {
        let entry = self.entry(symbol);

        if let Some(last) = entry.nonce
            && update.sequence <= last
        {
            return ApplyOutcome::Stale {
                last,
                received: update.sequence,
            };
        }

        entry.bids.merge(&update.bids);
        entry.asks.merge(&update.asks);
        entry.nonce = Some(update.sequence);
        entry.timestamp = Some(update.timestamp.unwrap_or_else(Utc::now));

        ApplyOutcome::Applied
    }

    /// Snapshot a symbol's book, each side truncated to `depth` levels when given.
    #[must_use]
    pub fn clone_book(&self, symbol: &str, depth: Option<usize>) -> Option<OrderBookState> {
        self.books.get(symbol).map(|entry| entry.snapshot(depth))
    }

    /// Snapshot a symbol's book using its registered depth limit.
    #[must_use]
    pub fn clone_limited(&self, symbol: &str) -> Option<OrderBookState> {
        self.books
            .get(symbol)
            .map(|entry| entry.snapshot(entry.depth_limit))
    }

    /// Register the depth limit applied to notifications for a symbol.
    pub fn set_depth_limit(&mut self, symbol: &str, limit: Option<usize>) {
        self.entry(symbol).depth_limit = limit;
    }

    /// Drop a symbol's book.
    pub fn remove(&mut self, symbol: &str) -> bool {
        self.books.remove(symbol).is_some()
    }

    /// Drop every book.
    pub fn clear(&mut self) {
        self.books.clear();
    }

    /// Symbols with a stored book.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.books.keys().cloned().collect()
    }

    /// Number of stored books.
    #[must_use]
    pub fn len(&self) -> usize {
        self.books.len()
    }

    /// Check if no book is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lvl(price: i64, size: i64) -> PriceLevel {
        PriceLevel::new(Decimal::from(price), Decimal::from(size))
    }

    fn diff(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, sequence: u64) -> IncrementalUpdate {
        IncrementalUpdate {
            bids,
            asks,
            sequence,
            timestamp: None,
        }
    }

    #[test]
    fn full_replace_preserves_descending_bids() {
        let mut store = OrderBookStore::new();
        let levels = vec![lvl(100, 1), lvl(99, 2), lvl(95, 7)];

        store.apply_full_replace("BTC/USD", BookSide::Bids, &levels);

        let book = store.clone_book("BTC/USD", None).unwrap();
        assert_eq!(book.bids, levels);
        assert!(book.asks.is_empty());
        assert!(book.timestamp.is_some());
    }

    #[test]
    fn full_replace_sorts_unordered_input() {
        let mut store = OrderBookStore::new();

        store.apply_full_replace("BTC/USD", BookSide::Asks, &[lvl(103, 1), lvl(101, 2)]);

        let book = store.clone_book("BTC/USD", None).unwrap();
        assert_eq!(book.asks, vec![lvl(101, 2), lvl(103, 1)]);
    }

    #[test]
    fn partial_update_keeps_other_side() {
        let mut store = OrderBookStore::new();
        store.apply_full_replace("BTC/USD", BookSide::Bids, &[lvl(100, 1)]);
        store.apply_full_replace("BTC/USD", BookSide::Asks, &[lvl(101, 3)]);

        store.apply_full_replace("BTC/USD", BookSide::Bids, &[lvl(98, 4)]);

        let book = store.clone_book("BTC/USD", None).unwrap();
        assert_eq!(book.bids, vec![lvl(98, 4)]);
        assert_eq!(book.asks, vec![lvl(101, 3)]);
    }

    #[test]
    fn incremental_merges_and_removes() {
        let mut store = OrderBookStore::new();

        let first = diff(vec![lvl(100, 1), lvl(99, 2)], vec![lvl(101, 1)], 1);
        assert!(store.apply_incremental("ETH/USD", &first).is_applied());

        let second = diff(vec![lvl(100, 0), lvl(99, 5)], vec![lvl(102, 2)], 2);
        assert!(store.apply_incremental("ETH/USD", &second).is_applied());

        let book = store.clone_book("ETH/USD", None).unwrap();
        assert_eq!(book.bids, vec![lvl(99, 5)]);
        assert_eq!(book.asks, vec![lvl(101, 1), lvl(102, 2)]);
        assert_eq!(book.nonce, Some(2));
    }

    #[test]
    fn stale_incremental_is_noop() {
        let mut store = OrderBookStore::new();
        store.apply_incremental("ETH/USD", &diff(vec![lvl(100, 1)], vec![], 10));
        let before = store.clone_book("ETH/USD", None).unwrap();

        let equal = store.apply_incremental("ETH/USD", &diff(vec![lvl(100, 9)], vec![], 10));
        let older = store.apply_incremental("ETH/USD", &diff(vec![lvl(90, 9)], vec![], 3));

        assert_eq!(
            equal,
            ApplyOutcome::Stale {
                last: 10,
                received: 10
            }
        );
        assert_eq!(older, ApplyOutcome::Stale { last: 10, received: 3 });
        assert_eq!(store.clone_book("ETH/USD", None).unwrap(), before);
    }

    #[test]
    fn snapshot_resets_sequence() {
        let mut store = OrderBookStore::new();
        store.apply_incremental("ETH/USD", &diff(vec![lvl(100, 1)], vec![], 50));

        store.apply_snapshot("ETH/USD", &[lvl(97, 1)], &[lvl(98, 1)], Some(5), None);
        assert!(
            store
                .apply_incremental("ETH/USD", &diff(vec![lvl(96, 1)], vec![], 6))
                .is_applied()
        );

        let book = store.clone_book("ETH/USD", None).unwrap();
        assert_eq!(book.bids, vec![lvl(97, 1), lvl(96, 1)]);
        assert_eq!(book.asks, vec![lvl(98, 1)]);
        assert_eq!(book.nonce, Some(6));
    }

    #[test]
    fn depth_limit_returns_best_levels() {
        let mut store = OrderBookStore::new();
        let bids: Vec<_> = (1..=20).map(|p| lvl(p, 1)).collect();
        let asks: Vec<_> = (21..=40).map(|p| lvl(p, 1)).collect();
        store.apply_full_replace("BTC/USD", BookSide::Bids, &bids);
        store.apply_full_replace("BTC/USD", BookSide::Asks, &asks);

        let book = store.clone_book("BTC/USD", Some(5)).unwrap();

        let bid_prices: Vec<_> = book.bids.iter().map(|l| l.price).collect();
        let ask_prices: Vec<_> = book.asks.iter().map(|l| l.price).collect();
        assert_eq!(bid_prices, [20, 19, 18, 17, 16].map(Decimal::from));
        assert_eq!(ask_prices, [21, 22, 23, 24, 25].map(Decimal::from));

        // Stored state keeps full depth
        assert_eq!(store.clone_book("BTC/USD", None).unwrap().bids.len(), 20);
    }

    #[test]
    fn clone_limited_uses_registered_depth() {
        let mut store = OrderBookStore::new();
        store.set_depth_limit("BTC/USD", Some(2));
        store.apply_full_replace("BTC/USD", BookSide::Bids, &[lvl(3, 1), lvl(2, 1), lvl(1, 1)]);

        let book = store.clone_limited("BTC/USD").unwrap();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.depth_limit, Some(2));
    }

    #[test]
    fn mutating_clone_does_not_touch_store() {
        let mut store = OrderBookStore::new();
        store.apply_full_replace("BTC/USD", BookSide::Bids, &[lvl(100, 1)]);

        let mut copy = store.clone_book("BTC/USD", None).unwrap();
        copy.bids.clear();
        copy.asks.push(lvl(1, 1));

        let book = store.clone_book("BTC/USD", None).unwrap();
        assert_eq!(book.bids, vec![lvl(100, 1)]);
        assert!(book.asks.is_empty());
    }

    #[test]
    fn unknown_symbol_has_no_book() {
        let store = OrderBookStore::new();
        assert!(store.clone_book("XRP/USD", None).is_none());
        assert!(store.is_empty());
    }

    fn level_strategy() -> impl Strategy<Value = PriceLevel> {
        (1i64..50, 0i64..5).prop_map(|(price, size)| lvl(price, size))
    }

    fn levels_strategy() -> impl Strategy<Value = Vec<PriceLevel>> {
        prop::collection::vec(level_strategy(), 0..12)
    }

    proptest! {
        #[test]
        fn cumulative_merge_matches_model(
            updates in prop::collection::vec((levels_strategy(), levels_strategy()), 1..8)
        ) {
            let mut store = OrderBookStore::new();
            let mut model_bids: BTreeMap<Decimal, Decimal> = BTreeMap::new();
            let mut model_asks: BTreeMap<Decimal, Decimal> = BTreeMap::new();

            for (seq, (bids, asks)) in updates.into_iter().enumerate() {
                for l in &bids {
                    if l.size.is_zero() { model_bids.remove(&l.price); } else { model_bids.insert(l.price, l.size); }
                }
                for l in &asks {
                    if l.size.is_zero() { model_asks.remove(&l.price); } else { model_asks.insert(l.price, l.size); }
                }
                let update = diff(bids, asks, seq as u64 + 1);
                prop_assert!(store.apply_incremental("BTC/USD", &update).is_applied());
            }

            let book = store.clone_book("BTC/USD", None).unwrap();
            let expected_bids: Vec<_> = model_bids.iter().rev().map(|(p, s)| PriceLevel::new(*p, *s)).collect();
            let expected_asks: Vec<_> = model_asks.iter().map(|(p, s)| PriceLevel::new(*p, *s)).collect();
            prop_assert_eq!(book.bids, expected_bids);
            prop_assert_eq!(book.asks, expected_asks);
        }

        #[test]
        fn stale_marker_never_changes_state(
            first in levels_strategy(),
            second in levels_strategy(),
            last in 1u64..1_000,
            back in 0u64..1_000,
        ) {
            let mut store = OrderBookStore::new();
            store.apply_incremental("BTC/USD", &diff(first.clone(), first, last));
            let before = store.clone_book("BTC/USD", None).unwrap();

            let received = last.saturating_sub(back);
            let outcome = store.apply_incremental("BTC/USD", &diff(second.clone(), second, received));

            prop_assert_eq!(outcome, ApplyOutcome::Stale { last, received });
            prop_assert_eq!(store.clone_book("BTC/USD", None).unwrap(), before);
        }

        #[test]
        fn depth_limited_sides_are_sorted_prefixes(levels in levels_strategy(), depth in 0usize..6) {
            let mut store = OrderBookStore::new();
            store.apply_full_replace("BTC/USD", BookSide::Bids, &levels);
            store.apply_full_replace("BTC/USD", BookSide::Asks, &levels);

            let full = store.clone_book("BTC/USD", None).unwrap();
            let limited = store.clone_book("BTC/USD", Some(depth)).unwrap();

            prop_assert!(full.bids.windows(2).all(|w| w[0].price > w[1].price));
            prop_assert!(full.asks.windows(2).all(|w| w[0].price < w[1].price));
            prop_assert_eq!(&limited.bids[..], &full.bids[..depth.min(full.bids.len())]);
            prop_assert_eq!(&limited.asks[..], &full.asks[..depth.min(full.asks.len())]);
        }
    }
}
