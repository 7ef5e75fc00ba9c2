//! Subscription Coordinator
//!
//! Turns subscribe/unsubscribe intents into outbound frames and correlates
//! them with asynchronous venue acknowledgments.
//!
//! # Lifecycle
//!
//! ```text
//! Unsubscribed --subscribe--> Subscribing --all sides acked--> Subscribed
//!      ^                          |                               |
//!      +---timeout / cancel-------+                               |
//!      +---unsubscribe--------------------------------------------+
//! ```
//!
//! Every request is a [`PendingEntry`] keyed by its nonce. An entry leaves
//! the pending table exactly once, on completion, timeout or teardown, and
//! its outcome sender is consumed at that point, so a result is reported at
//! most once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::context::{ConnectionContext, PendingEntry, TimerId};
use crate::application::ports::{Transport, TransportError, VenueProtocol};
use crate::domain::channel::ChannelBinding;
use crate::domain::subscription::{
    EventKind, Nonce, SideFlags, Symbol, SubscriptionIntent, SubscriptionKey, SubscriptionPhase,
};
use crate::infrastructure::metrics::{self, OutcomeKind};

/// Default time to wait for every required acknowledgment.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Subscription request failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Event kind not streamed by the venue.
    #[error("{kind} subscriptions are not supported by {venue}")]
    UnsupportedOperation {
        /// Requested kind.
        kind: EventKind,
        /// Venue dialect name.
        venue: &'static str,
    },

    /// Not every required side was acknowledged in time.
    #[error("subscription to {symbol} (nonce {nonce}) timed out after {after:?}")]
    Timeout {
        /// Requested symbol.
        symbol: Symbol,
        /// Request nonce.
        nonce: Nonce,
        /// Configured timeout.
        after: Duration,
    },

    /// Request was abandoned by unsubscribe or connection teardown.
    #[error("subscription to {symbol} (nonce {nonce}) cancelled")]
    Cancelled {
        /// Requested symbol.
        symbol: Symbol,
        /// Request nonce.
        nonce: Nonce,
    },

    /// The nonce is already pending for the same subscription.
    #[error("nonce {nonce} already pending for {symbol}")]
    DuplicateNonce {
        /// Requested symbol.
        symbol: Symbol,
        /// Request nonce.
        nonce: Nonce,
    },

    /// The request cannot be mapped to venue channels.
    #[error("invalid subscription request: {0}")]
    InvalidRequest(String),

    /// The subscribe frame could not be written.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Final result of a subscribe request.
pub type SubscriptionResult = Result<(), SubscriptionError>;

/// Future resolving once a subscribe request completes, times out or is
/// cancelled.
#[derive(Debug)]
#[must_use = "dropping the outcome discards the acknowledgment result"]
pub struct SubscriptionOutcome {
    key: SubscriptionKey,
    nonce: Nonce,
    rx: oneshot::Receiver<SubscriptionResult>,
}

impl SubscriptionOutcome {
    /// Subscription key the request targets.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Request nonce.
    #[must_use]
    pub const fn nonce(&self) -> Nonce {
        self.nonce
    }
}

impl Future for SubscriptionOutcome {
    type Output = SubscriptionResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped with the context
            Poll::Ready(Err(_)) => Poll::Ready(Err(SubscriptionError::Cancelled {
                symbol: this.key.symbol.clone(),
                nonce: this.nonce,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Correlates subscription requests with venue acknowledgments.
#[derive(Clone)]
pub struct SubscriptionCoordinator {
    protocol: Arc<dyn VenueProtocol>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl std::fmt::Debug for SubscriptionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCoordinator")
            .field("venue", &self.protocol.name())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SubscriptionCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        protocol: Arc<dyn VenueProtocol>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Self {
        Self {
            protocol,
            transport,
            timeout,
        }
    }

    /// Configured acknowledgment timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a subscribe request and send its frames.
    ///
    /// # Errors
    ///
    /// Fails synchronously, with no lasting side effect, when the kind is
    /// unsupported, the nonce is already pending for the key, the request
    /// cannot be resolved to channels, or the transport refuses a frame.
    pub fn subscribe(
        &self,
        ctx: &mut ConnectionContext,
        intent: SubscriptionIntent,
    ) -> Result<SubscriptionOutcome, SubscriptionError> {
        let venue = self.protocol.name();
        if !self.protocol.supports(intent.kind) {
            return Err(SubscriptionError::UnsupportedOperation {
                kind: intent.kind,
                venue,
            });
        }

        let key = intent.key();
        if ctx
            .pending
            .get(&key)
            .is_some_and(|set| set.contains(intent.nonce))
        {
            return Err(SubscriptionError::DuplicateNonce {
                symbol: intent.symbol,
                nonce: intent.nonce,
            });
        }

        let bindings = self
            .protocol
            .channels_for(&intent.symbol, intent.kind, &intent.options)
            .map_err(|e| SubscriptionError::InvalidRequest(e.to_string()))?;
        if bindings.is_empty() {
            return Err(SubscriptionError::InvalidRequest(format!(
                "no channels for {key}"
            )));
        }

        let required = bindings
            .iter()
            .fold(SideFlags::NONE, |acc, b| acc.union(b.sides));
        let was_bound = !ctx.channels.channels_for(&key).is_empty();
        for binding in &bindings {
            ctx.retired.remove(&binding.channel);
            ctx.channels.insert(binding.clone());
        }

        let (tx, rx) = oneshot::channel();
        let outcome = SubscriptionOutcome {
            key: key.clone(),
            nonce: intent.nonce,
            rx,
        };

        if !self.protocol.capabilities().acks_subscribe {
            if let Err(e) = self.send_all(ctx, &bindings, |b| self.protocol.encode_subscribe(b)) {
                if !was_bound {
                    ctx.channels.remove_key(&key);
                }
                return Err(e.into());
            }
            self.register_depth(ctx, &intent);
            ctx.confirmed.insert(key.clone());
            let _ = tx.send(Ok(()));
            metrics::record_outcome(venue, OutcomeKind::Acknowledged, 1);
            info!(context = %ctx.id(), %key, nonce = intent.nonce, "Subscribed without acknowledgment");
            return Ok(outcome);
        }

        let timer = ctx.schedule_expiry(self.timeout, key.clone(), intent.nonce);
        ctx.pending
            .entry(key.clone())
            .or_default()
            .insert(intent.nonce, PendingEntry::new(required, Some(timer), tx));

        if let Err(e) = self.send_all(ctx, &bindings, |b| self.protocol.encode_subscribe(b)) {
            if let Some(entry) = ctx.take_pending(&key, intent.nonce) {
                entry.resolve(Err(SubscriptionError::Transport(e.clone())));
            }
            if !was_bound && ctx.pending_for(&key) == 0 && !ctx.confirmed.contains(&key) {
                ctx.channels.remove_key(&key);
            }
            warn!(context = %ctx.id(), %key, nonce = intent.nonce, error = %e, "Subscribe frame rejected");
            return Err(e.into());
        }

        self.register_depth(ctx, &intent);
        metrics::add_pending(venue);
        debug!(
            context = %ctx.id(),
            %key,
            nonce = intent.nonce,
            channels = bindings.len(),
            required = ?required,
            "Subscription pending"
        );
        Ok(outcome)
    }

    /// Drop a subscription, cancelling any request still pending for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the kind is unsupported, the request cannot be
    /// resolved to channels, or the transport refuses a frame. Local state is
    /// cleared before any frame is sent.
    pub fn unsubscribe(
        &self,
        ctx: &mut ConnectionContext,
        intent: &SubscriptionIntent,
    ) -> Result<(), SubscriptionError> {
        let venue = self.protocol.name();
        if !self.protocol.supports(intent.kind) {
            return Err(SubscriptionError::UnsupportedOperation {
                kind: intent.kind,
                venue,
            });
        }

        let key = intent.key();
        let mut bindings = ctx.channels.remove_key(&key);
        if bindings.is_empty() {
            bindings = self
                .protocol
                .channels_for(&intent.symbol, intent.kind, &intent.options)
                .map_err(|e| SubscriptionError::InvalidRequest(e.to_string()))?;
        }

        ctx.retired.extend(bindings.iter().map(|b| b.channel.clone()));
        ctx.confirmed.remove(&key);
        if intent.kind == EventKind::OrderBook {
            ctx.books.remove(&intent.symbol);
        }
        let cancelled = ctx.pending.remove(&key).map(|mut set| set.drain()).unwrap_or_default();
        if !cancelled.is_empty() {
            Self::record_cancelled(venue, cancelled.len());
        }
        for (nonce, entry) in cancelled {
            entry.resolve(Err(SubscriptionError::Cancelled {
                symbol: key.symbol.clone(),
                nonce,
            }));
        }

        self.send_all(ctx, &bindings, |b| self.protocol.encode_unsubscribe(b))?;
        info!(context = %ctx.id(), %key, channels = bindings.len(), "Unsubscribed");
        Ok(())
    }

    /// Mark sides acknowledged for the key owning `channel`.
    ///
    /// Returns the number of requests completed by this ack. Acks for
    /// unknown channels or keys with nothing pending are dropped.
    pub fn on_ack(
        &self,
        ctx: &mut ConnectionContext,
        channel: &str,
        sides: Option<SideFlags>,
    ) -> usize {
        let Some(binding) = ctx.channels.get(channel) else {
            debug!(context = %ctx.id(), channel, "Ack for unknown channel dropped");
            return 0;
        };
        let key = binding.key();
        let sides = sides.unwrap_or(binding.sides);

        let Some(set) = ctx.pending.get_mut(&key) else {
            debug!(context = %ctx.id(), %key, channel, "Late or duplicate ack ignored");
            return 0;
        };
        let completed = set.acknowledge(sides);
        if set.is_empty() {
            ctx.pending.remove(&key);
        }
        if completed.is_empty() {
            debug!(context = %ctx.id(), %key, channel, sides = ?sides, "Partial ack");
            return 0;
        }

        ctx.confirmed.insert(key.clone());
        let count = completed.len();
        for (nonce, entry) in completed {
            entry.resolve(Ok(()));
            info!(context = %ctx.id(), %key, nonce, "Subscribed");
        }

        let venue = self.protocol.name();
        metrics::record_outcome(venue, OutcomeKind::Acknowledged, count);
        metrics::remove_pending(venue, count);
        count
    }

    /// Release a retired channel once the venue confirms its unsubscribe.
    ///
    /// Dialects that never ack unsubscribes keep their channels retired
    /// until they are bound again, so the ack is dropped.
    pub fn on_unsubscribe_ack(&self, ctx: &mut ConnectionContext, channel: &str) -> bool {
        if !self.protocol.capabilities().acks_unsubscribe {
            debug!(context = %ctx.id(), channel, "Unsubscribe ack from non-acking venue ignored");
            return false;
        }
        if !ctx.retired.remove(channel) {
            debug!(context = %ctx.id(), channel, "Unsubscribe ack for unknown channel dropped");
            return false;
        }
        info!(context = %ctx.id(), channel, "Unsubscribe confirmed");
        true
    }

    /// Expire a request if it is still pending under `timer`.
    ///
    /// Returns false when the entry was already resolved, which happens when
    /// an ack was processed after the timer fired but before its event was,
    /// or when a later request reused the nonce and armed its own timer.
    pub fn on_timeout(
        &self,
        ctx: &mut ConnectionContext,
        key: &SubscriptionKey,
        nonce: Nonce,
        timer: TimerId,
    ) -> bool {
        let Some(entry) = ctx.take_expired(key, nonce, timer) else {
            debug!(context = %ctx.id(), %key, nonce, "Timer for resolved request ignored");
            return false;
        };

        warn!(
            context = %ctx.id(),
            %key,
            nonce,
            acknowledged = ?entry.acknowledged(),
            timeout_ms = self.timeout.as_millis(),
            "Subscription timed out"
        );
        entry.resolve(Err(SubscriptionError::Timeout {
            symbol: key.symbol.clone(),
            nonce,
            after: self.timeout,
        }));

        let venue = self.protocol.name();
        metrics::record_outcome(venue, OutcomeKind::Timeout, 1);
        metrics::remove_pending(venue, 1);
        true
    }

    /// Cancel every pending request. Returns the number cancelled.
    pub fn cancel_all(&self, ctx: &mut ConnectionContext) -> usize {
        let drained = ctx.drain_pending();
        let count = drained.len();
        for (key, nonce, entry) in drained {
            entry.resolve(Err(SubscriptionError::Cancelled {
                symbol: key.symbol,
                nonce,
            }));
        }
        if count > 0 {
            Self::record_cancelled(self.protocol.name(), count);
        }
        count
    }

    /// Lifecycle phase of a key.
    #[must_use]
    pub fn phase(&self, ctx: &ConnectionContext, kind: EventKind, symbol: &str) -> SubscriptionPhase {
        ctx.phase(&SubscriptionKey::new(kind, symbol))
    }

    fn register_depth(&self, ctx: &mut ConnectionContext, intent: &SubscriptionIntent) {
        if intent.kind == EventKind::OrderBook
            && let Some(depth) = intent.options.depth
        {
            ctx.books.set_depth_limit(&intent.symbol, Some(depth));
        }
    }

    fn send_all(
        &self,
        ctx: &ConnectionContext,
        bindings: &[ChannelBinding],
        encode: impl Fn(&ChannelBinding) -> String,
    ) -> Result<(), TransportError> {
        for binding in bindings {
            self.transport.send(ctx.id(), encode(binding))?;
        }
        Ok(())
    }

    fn record_cancelled(venue: &'static str, count: usize) {
        metrics::record_outcome(venue, OutcomeKind::Cancelled, count);
        metrics::remove_pending(venue, count);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::FutureExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::services::driver::ContextEvent;
    use crate::application::ports::{
        DialectCapabilities, MockTransport, ResolveError, SymbolResolver,
    };
    use crate::domain::connection::ContextId;
    use crate::domain::frame::{InboundFrame, ProtocolError};
    use crate::domain::subscription::SubscribeOptions;

    /// Two-channel venue: one channel per book side.
    struct SideChannels {
        acks: bool,
    }

    impl SymbolResolver for SideChannels {
        fn channels_for(
            &self,
            symbol: &str,
            kind: EventKind,
            _options: &SubscribeOptions,
        ) -> Result<Vec<ChannelBinding>, ResolveError> {
            if symbol == "BAD" {
                return Err(ResolveError::InvalidSymbol(symbol.into()));
            }
            Ok(vec![
                ChannelBinding::new(format!("{symbol}:buy"), kind, symbol, SideFlags::BUY),
                ChannelBinding::new(format!("{symbol}:sell"), kind, symbol, SideFlags::SELL),
            ])
        }

        fn symbol_for_channel(&self, channel: &str) -> Option<Symbol> {
            channel.split(':').next().map(str::to_string)
        }
    }

    impl VenueProtocol for SideChannels {
        fn name(&self) -> &'static str {
            "test"
        }

        fn capabilities(&self) -> DialectCapabilities {
            DialectCapabilities {
                full_replace: true,
                snapshot: false,
                incremental: false,
                heartbeat: None,
                acks_subscribe: self.acks,
                acks_unsubscribe: self.acks,
            }
        }

        fn encode_subscribe(&self, binding: &ChannelBinding) -> String {
            format!("sub {}", binding.channel)
        }

        fn encode_unsubscribe(&self, binding: &ChannelBinding) -> String {
            format!("unsub {}", binding.channel)
        }

        fn encode_heartbeat(&self) -> Option<String> {
            None
        }

        fn decode(&self, _raw: &str) -> Result<Vec<InboundFrame>, ProtocolError> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<String>>,
    }

    impl Transport for Recorder {
        fn send(&self, _context: ContextId, frame: String) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    struct Fixture {
        coordinator: SubscriptionCoordinator,
        transport: Arc<Recorder>,
        ctx: ConnectionContext,
        events: mpsc::UnboundedReceiver<ContextEvent>,
        _tx: mpsc::UnboundedSender<ContextEvent>,
    }

    fn fixture(acks: bool) -> Fixture {
        let transport = Arc::new(Recorder::default());
        let (tx, events) = mpsc::unbounded_channel();
        Fixture {
            coordinator: SubscriptionCoordinator::new(
                Arc::new(SideChannels { acks }),
                transport.clone(),
                Duration::from_millis(1000),
            ),
            transport,
            ctx: ConnectionContext::new(ContextId::new(), &tx),
            events,
            _tx: tx,
        }
    }

    fn book(symbol: &str, nonce: Nonce) -> SubscriptionIntent {
        SubscriptionIntent::order_book(symbol, nonce)
    }

    #[tokio::test]
    async fn resolves_after_both_sides_acked() {
        let mut f = fixture(true);
        let outcome = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 7)).unwrap();

        assert_eq!(
            *f.transport.frames.lock().unwrap(),
            ["sub BTC/USD:buy", "sub BTC/USD:sell"]
        );
        assert_eq!(f.ctx.phase(outcome.key()), SubscriptionPhase::Subscribing);

        assert_eq!(f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None), 0);
        assert_eq!(f.ctx.pending_count(), 1);

        assert_eq!(f.coordinator.on_ack(&mut f.ctx, "BTC/USD:sell", None), 1);
        assert_eq!(f.ctx.pending_count(), 0);
        assert_eq!(outcome.await, Ok(()));
        assert_eq!(
            f.coordinator.phase(&f.ctx, EventKind::OrderBook, "BTC/USD"),
            SubscriptionPhase::Subscribed
        );
    }

    #[tokio::test]
    async fn outcome_wakes_only_on_final_ack() {
        let mut f = fixture(true);
        let mut outcome =
            tokio_test::task::spawn(f.coordinator.subscribe(&mut f.ctx, book("ETH/USD", 1)).unwrap());

        tokio_test::assert_pending!(outcome.poll());
        f.coordinator.on_ack(&mut f.ctx, "ETH/USD:sell", None);
        assert!(!outcome.is_woken());
        tokio_test::assert_pending!(outcome.poll());

        f.coordinator.on_ack(&mut f.ctx, "ETH/USD:buy", None);
        assert!(outcome.is_woken());
        assert_eq!(tokio_test::assert_ready!(outcome.poll()), Ok(()));
    }

    #[tokio::test]
    async fn unsupported_kind_has_no_side_effect() {
        let mut f = fixture(true);
        let err = f
            .coordinator
            .subscribe(&mut f.ctx, SubscriptionIntent::new(EventKind::Trades, "BTC/USD", 1))
            .unwrap_err();

        assert_eq!(
            err,
            SubscriptionError::UnsupportedOperation {
                kind: EventKind::Trades,
                venue: "test"
            }
        );
        assert!(f.transport.frames.lock().unwrap().is_empty());
        assert!(f.ctx.channels().is_empty());
        assert_eq!(f.ctx.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_nonce_rejected() {
        let mut f = fixture(true);
        let _first = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap();

        let err = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap_err();
        assert!(matches!(err, SubscriptionError::DuplicateNonce { nonce: 1, .. }));
        assert_eq!(f.ctx.pending_count(), 1);
    }

    #[tokio::test]
    async fn resolution_failure_is_invalid_request() {
        let mut f = fixture(true);
        let err = f.coordinator.subscribe(&mut f.ctx, book("BAD", 1)).unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn one_ack_completes_every_pending_nonce() {
        let mut f = fixture(true);
        let a = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap();
        let b = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 2)).unwrap();

        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None);
        assert_eq!(f.coordinator.on_ack(&mut f.ctx, "BTC/USD:sell", None), 2);

        assert_eq!(a.await, Ok(()));
        assert_eq!(b.await, Ok(()));
    }

    #[tokio::test]
    async fn late_and_unknown_acks_are_noops() {
        let mut f = fixture(true);
        let outcome = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap();
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None);
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:sell", None);
        assert_eq!(outcome.await, Ok(()));

        assert_eq!(f.coordinator.on_ack(&mut f.ctx, "BTC/USD:sell", None), 0);
        assert_eq!(f.coordinator.on_ack(&mut f.ctx, "XRP/USD:buy", None), 0);
        assert_eq!(f.ctx.phase(&book("BTC/USD", 1).key()), SubscriptionPhase::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_expires_unacknowledged_request() {
        let mut f = fixture(true);
        let outcome = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 3)).unwrap();
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None);

        let Some(ContextEvent::SubscriptionExpired { key, nonce, timer }) = f.events.recv().await
        else {
            panic!("expected expiry event");
        };
        assert!(f.coordinator.on_timeout(&mut f.ctx, &key, nonce, timer));

        let err = outcome.await.unwrap_err();
        assert_eq!(
            err,
            SubscriptionError::Timeout {
                symbol: "BTC/USD".into(),
                nonce: 3,
                after: Duration::from_millis(1000)
            }
        );
        assert_eq!(f.ctx.phase(&key), SubscriptionPhase::Unsubscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_processed_before_fired_timer_wins() {
        let mut f = fixture(true);
        let mut outcome = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 4)).unwrap();

        // Let the timer fire and post its event without processing it
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!((&mut outcome).now_or_never().is_none());

        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None);
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:sell", None);

        let Ok(ContextEvent::SubscriptionExpired { key, nonce, timer }) = f.events.try_recv() else {
            panic!("expected queued expiry event");
        };
        assert!(!f.coordinator.on_timeout(&mut f.ctx, &key, nonce, timer));
        assert_eq!(outcome.await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_expiry_spares_request_reusing_its_nonce() {
        let mut f = fixture(true);
        let first = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap();

        // First timer fires and queues its event unprocessed
        tokio::time::sleep(Duration::from_millis(1001)).await;
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None);
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:sell", None);
        assert_eq!(first.await, Ok(()));

        let mut second = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap();

        let Ok(ContextEvent::SubscriptionExpired { key, nonce, timer }) = f.events.try_recv() else {
            panic!("expected queued expiry event");
        };
        assert!(!f.coordinator.on_timeout(&mut f.ctx, &key, nonce, timer));
        assert!((&mut second).now_or_never().is_none());
        assert_eq!(f.ctx.pending_count(), 1);

        // The second request still gets its full timeout
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert!(f.events.try_recv().is_err());
        tokio::time::sleep(Duration::from_millis(2)).await;
        let Some(ContextEvent::SubscriptionExpired { key, nonce, timer }) = f.events.recv().await
        else {
            panic!("expected second expiry event");
        };
        assert!(f.coordinator.on_timeout(&mut f.ctx, &key, nonce, timer));
        assert!(matches!(second.await, Err(SubscriptionError::Timeout { nonce: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn resolved_request_cancels_its_timer() {
        let mut f = fixture(true);
        let outcome = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 5)).unwrap();
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None);
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:sell", None);
        assert_eq!(outcome.await, Ok(()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_all_resolves_every_pending() {
        let mut f = fixture(true);
        let outcomes: Vec<_> = ["BTC/USD", "ETH/USD", "LTC/USD"]
            .iter()
            .enumerate()
            .map(|(i, s)| f.coordinator.subscribe(&mut f.ctx, book(s, i as Nonce)).unwrap())
            .collect();

        assert_eq!(f.coordinator.cancel_all(&mut f.ctx), 3);

        for outcome in outcomes {
            assert!(matches!(outcome.await, Err(SubscriptionError::Cancelled { .. })));
        }
        assert_eq!(f.ctx.pending_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_clears_bindings_and_cancels_pending() {
        let mut f = fixture(true);
        let outcome = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap();
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None);

        f.coordinator.unsubscribe(&mut f.ctx, &book("BTC/USD", 2)).unwrap();

        assert!(matches!(outcome.await, Err(SubscriptionError::Cancelled { nonce: 1, .. })));
        assert!(!f.ctx.channels().contains("BTC/USD:buy"));
        assert_eq!(f.ctx.phase(&book("BTC/USD", 1).key()), SubscriptionPhase::Unsubscribed);
        let frames = f.transport.frames.lock().unwrap();
        assert!(frames.ends_with(&["unsub BTC/USD:buy".to_string(), "unsub BTC/USD:sell".to_string()]));
    }

    #[tokio::test]
    async fn unsubscribe_ack_releases_retired_channel() {
        let mut f = fixture(true);
        let outcome = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap();
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:buy", None);
        f.coordinator.on_ack(&mut f.ctx, "BTC/USD:sell", None);
        assert_eq!(outcome.await, Ok(()));

        f.coordinator.unsubscribe(&mut f.ctx, &book("BTC/USD", 2)).unwrap();
        assert!(f.ctx.is_retired("BTC/USD:buy"));
        assert!(f.ctx.is_retired("BTC/USD:sell"));

        assert!(f.coordinator.on_unsubscribe_ack(&mut f.ctx, "BTC/USD:buy"));
        assert!(!f.coordinator.on_unsubscribe_ack(&mut f.ctx, "BTC/USD:buy"));
        assert!(!f.ctx.is_retired("BTC/USD:buy"));
        assert!(f.ctx.is_retired("BTC/USD:sell"));
    }

    #[tokio::test]
    async fn non_acking_venue_keeps_channels_retired_until_rebound() {
        let mut f = fixture(false);
        let _ = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 1)).unwrap();
        f.coordinator.unsubscribe(&mut f.ctx, &book("BTC/USD", 2)).unwrap();

        assert!(!f.coordinator.on_unsubscribe_ack(&mut f.ctx, "BTC/USD:buy"));
        assert!(f.ctx.is_retired("BTC/USD:buy"));

        let _ = f.coordinator.subscribe(&mut f.ctx, book("BTC/USD", 3)).unwrap();
        assert!(!f.ctx.is_retired("BTC/USD:buy"));
        assert!(!f.ctx.is_retired("BTC/USD:sell"));
    }

    #[tokio::test]
    async fn non_acking_venue_resolves_immediately() {
        let mut f = fixture(false);
        let intent = book("BTC/USD", 1).with_options(SubscribeOptions::default().with_depth(5));

        let outcome = f.coordinator.subscribe(&mut f.ctx, intent).unwrap();

        assert_eq!(outcome.await, Ok(()));
        assert_eq!(f.ctx.pending_count(), 0);
        assert_eq!(f.ctx.books().clone_book("BTC/USD", None).unwrap().depth_limit, Some(5));
    }

    #[tokio::test]
    async fn transport_failure_rolls_back() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _| Err(TransportError::Closed));

        let (tx, _events) = mpsc::unbounded_channel();
        let mut ctx = ConnectionContext::new(ContextId::new(), &tx);
        let coordinator = SubscriptionCoordinator::new(
            Arc::new(SideChannels { acks: true }),
            Arc::new(transport),
            Duration::from_secs(1),
        );

        let err = coordinator.subscribe(&mut ctx, book("BTC/USD", 1)).unwrap_err();

        assert_eq!(err, SubscriptionError::Transport(TransportError::Closed));
        assert_eq!(ctx.pending_count(), 0);
        assert!(ctx.channels().is_empty());
    }
}
