//! Connection Context
//!
//! Per-connection state: channel bindings, retired channels, pending requests,
//! confirmed subscriptions, the order-book store and the heartbeat timer.
//! A context is owned by exactly one driver task and is never shared.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use super::coordinator::SubscriptionResult;
use super::driver::ContextEvent;
use super::heartbeat::HeartbeatHandle;
use crate::domain::channel::{ChannelId, ChannelMap};
use crate::domain::connection::ContextId;
use crate::domain::order_book::OrderBookStore;
use crate::domain::subscription::{Nonce, SideFlags, SubscriptionKey, SubscriptionPhase};

// =============================================================================
// Timers
// =============================================================================

/// Identifies one armed timer within a context. Never reused.
pub type TimerId = u64;

/// Schedules events back into a context's queue after a delay.
///
/// Holds only a weak sender so pending timers never keep a context alive.
#[derive(Debug, Clone)]
pub struct TimerScheduler {
    events: mpsc::WeakUnboundedSender<ContextEvent>,
}

impl TimerScheduler {
    /// Create a scheduler posting into `events`.
    #[must_use]
    pub fn new(events: &mpsc::UnboundedSender<ContextEvent>) -> Self {
        Self {
            events: events.downgrade(),
        }
    }

    /// Post `event` after `after` elapses. `id` tags the returned handle.
    #[must_use]
    pub fn schedule(&self, id: TimerId, after: Duration, event: ContextEvent) -> TimerHandle {
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(event);
            }
        });

        TimerHandle {
            id,
            abort: task.abort_handle(),
        }
    }
}

/// Handle to a scheduled timer.
///
/// Cancelling cannot retract an event the timer already posted.
#[derive(Debug)]
pub struct TimerHandle {
    id: TimerId,
    abort: AbortHandle,
}

impl TimerHandle {
    /// Timer id.
    #[must_use]
    pub const fn id(&self) -> TimerId {
        self.id
    }

    /// Cancel the timer.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

// =============================================================================
// Pending Requests
// =============================================================================

/// One subscribe request awaiting acknowledgment.
#[derive(Debug)]
pub struct PendingEntry {
    required: SideFlags,
    acknowledged: SideFlags,
    timeout: Option<TimerHandle>,
    outcome: oneshot::Sender<SubscriptionResult>,
}

impl PendingEntry {
    /// Create an entry with nothing acknowledged.
    #[must_use]
    pub const fn new(
        required: SideFlags,
        timeout: Option<TimerHandle>,
        outcome: oneshot::Sender<SubscriptionResult>,
    ) -> Self {
        Self {
            required,
            acknowledged: SideFlags::NONE,
            timeout,
            outcome,
        }
    }

    /// Mark sides acknowledged. Returns true once every required side is.
    pub const fn acknowledge(&mut self, sides: SideFlags) -> bool {
        self.acknowledged.insert(sides);
        self.is_complete()
    }

    /// Check if every required side is acknowledged.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.acknowledged.contains(self.required)
    }

    /// Sides acknowledged so far.
    #[must_use]
    pub const fn acknowledged(&self) -> SideFlags {
        self.acknowledged
    }

    /// Id of the expiry timer guarding this entry.
    #[must_use]
    pub fn timer_id(&self) -> Option<TimerId> {
        self.timeout.as_ref().map(TimerHandle::id)
    }

    /// Cancel the timer and report the result to the caller.
    pub fn resolve(self, result: SubscriptionResult) {
        if let Some(timer) = &self.timeout {
            timer.cancel();
        }
        // Caller may have dropped the outcome
        let _ = self.outcome.send(result);
    }
}

/// Pending requests of one subscription key, by nonce.
#[derive(Debug, Default)]
pub struct PendingSet {
    entries: HashMap<Nonce, PendingEntry>,
}

impl PendingSet {
    /// Register an entry.
    pub fn insert(&mut self, nonce: Nonce, entry: PendingEntry) {
        self.entries.insert(nonce, entry);
    }

    /// Remove an entry.
    pub fn remove(&mut self, nonce: Nonce) -> Option<PendingEntry> {
        self.entries.remove(&nonce)
    }

    /// Pending entry for a nonce.
    #[must_use]
    pub fn get(&self, nonce: Nonce) -> Option<&PendingEntry> {
        self.entries.get(&nonce)
    }

    /// Check if a nonce is pending.
    #[must_use]
    pub fn contains(&self, nonce: Nonce) -> bool {
        self.entries.contains_key(&nonce)
    }

    /// Mark sides on every entry, removing and returning the completed ones.
    pub fn acknowledge(&mut self, sides: SideFlags) -> Vec<(Nonce, PendingEntry)> {
        let completed: Vec<Nonce> = self
            .entries
            .iter_mut()
            .filter_map(|(nonce, entry)| entry.acknowledge(sides).then_some(*nonce))
            .collect();

        completed
            .into_iter()
            .filter_map(|nonce| self.entries.remove_entry(&nonce))
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<(Nonce, PendingEntry)> {
        self.entries.drain().collect()
    }

    /// Number of pending entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Connection Context
// =============================================================================

/// State of one live connection.
#[derive(Debug)]
pub struct ConnectionContext {
    id: ContextId,
    pub(crate) channels: ChannelMap,
    pub(crate) retired: HashSet<ChannelId>,
    pub(crate) pending: HashMap<SubscriptionKey, PendingSet>,
    pub(crate) confirmed: HashSet<SubscriptionKey>,
    pub(crate) books: OrderBookStore,
    pub(crate) heartbeat: Option<HeartbeatHandle>,
    scheduler: TimerScheduler,
    last_timer: TimerId,
}

impl ConnectionContext {
    /// Create a fresh context whose timers post into `events`.
    #[must_use]
    pub fn new(id: ContextId, events: &mpsc::UnboundedSender<ContextEvent>) -> Self {
        Self {
            id,
            channels: ChannelMap::new(),
            retired: HashSet::new(),
            pending: HashMap::new(),
            confirmed: HashSet::new(),
            books: OrderBookStore::new(),
            heartbeat: None,
            scheduler: TimerScheduler::new(events),
            last_timer: 0,
        }
    }

    /// Context id.
    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    /// Arm the expiry timer of a pending request under a fresh id.
    pub(crate) fn schedule_expiry(
        &mut self,
        after: Duration,
        key: SubscriptionKey,
        nonce: Nonce,
    ) -> TimerHandle {
        self.last_timer += 1;
        let timer = self.last_timer;
        self.scheduler.schedule(
            timer,
            after,
            ContextEvent::SubscriptionExpired { key, nonce, timer },
        )
    }

    /// Channel bindings.
    #[must_use]
    pub const fn channels(&self) -> &ChannelMap {
        &self.channels
    }

    /// Check if a channel was unsubscribed and not bound since.
    #[must_use]
    pub fn is_retired(&self, channel: &str) -> bool {
        self.retired.contains(channel)
    }

    /// Order books.
    #[must_use]
    pub const fn books(&self) -> &OrderBookStore {
        &self.books
    }

    /// Check if a heartbeat timer is armed.
    #[must_use]
    pub const fn has_heartbeat(&self) -> bool {
        self.heartbeat.is_some()
    }

    /// Total pending requests across every key.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(PendingSet::len).sum()
    }

    /// Pending requests for one key.
    #[must_use]
    pub fn pending_for(&self, key: &SubscriptionKey) -> usize {
        self.pending.get(key).map_or(0, PendingSet::len)
    }

    /// Lifecycle phase of a key.
    #[must_use]
    pub fn phase(&self, key: &SubscriptionKey) -> SubscriptionPhase {
        if self.pending.get(key).is_some_and(|set| !set.is_empty()) {
            SubscriptionPhase::Subscribing
        } else if self.confirmed.contains(key) {
            SubscriptionPhase::Subscribed
        } else {
            SubscriptionPhase::Unsubscribed
        }
    }

    /// Remove one pending entry, dropping the key's set once empty.
    pub(crate) fn take_pending(
        &mut self,
        key: &SubscriptionKey,
        nonce: Nonce,
    ) -> Option<PendingEntry> {
        let set = self.pending.get_mut(key)?;
        let entry = set.remove(nonce);
        if set.is_empty() {
            self.pending.remove(key);
        }
        entry
    }

    /// Remove a pending entry only if `timer` is the one guarding it.
    ///
    /// An expiry posted for an earlier request that reused the nonce leaves
    /// the current entry in place.
    pub(crate) fn take_expired(
        &mut self,
        key: &SubscriptionKey,
        nonce: Nonce,
        timer: TimerId,
    ) -> Option<PendingEntry> {
        let current = self.pending.get(key)?.get(nonce)?.timer_id();
        if current != Some(timer) {
            return None;
        }
        self.take_pending(key, nonce)
    }

    /// Remove and return every pending entry.
    pub(crate) fn drain_pending(&mut self) -> Vec<(SubscriptionKey, Nonce, PendingEntry)> {
        self.pending
            .drain()
            .flat_map(|(key, mut set)| {
                set.drain()
                    .into_iter()
                    .map(move |(nonce, entry)| (key.clone(), nonce, entry))
            })
            .collect()
    }
}
