//! Context Driver
//!
//! Each connection context is owned by one task draining a single FIFO of
//! [`ContextEvent`]s: transport notifications, caller commands and timer
//! expiries. Events for one context are handled strictly in arrival order
//! and never concurrently; independent contexts run on independent tasks.
//!
//! Callers talk to the task through a cloneable [`ContextHandle`].

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::context::{ConnectionContext, TimerId};
use super::coordinator::{SubscriptionCoordinator, SubscriptionError, SubscriptionOutcome};
use super::dispatcher::Dispatcher;
use crate::application::ports::TransportError;
use crate::domain::connection::ContextId;
use crate::domain::order_book::OrderBookState;
use crate::domain::subscription::{
    EventKind, Nonce, Symbol, SubscriptionIntent, SubscriptionKey, SubscriptionPhase,
};

// =============================================================================
// Events
// =============================================================================

/// Notification from the raw transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established.
    Opened,
    /// Inbound text frame.
    Frame(String),
    /// Connection closed.
    Closed,
}

/// Caller request executed on the context task.
#[derive(Debug)]
pub enum Command {
    /// Register a subscribe request.
    Subscribe {
        /// Request.
        intent: SubscriptionIntent,
        /// Synchronous result.
        reply: oneshot::Sender<Result<SubscriptionOutcome, SubscriptionError>>,
    },
    /// Drop a subscription.
    Unsubscribe {
        /// Request.
        intent: SubscriptionIntent,
        /// Result.
        reply: oneshot::Sender<Result<(), SubscriptionError>>,
    },
    /// Copy a symbol's book.
    Snapshot {
        /// Unified symbol.
        symbol: Symbol,
        /// Depth override; the registered limit applies when `None`.
        depth: Option<usize>,
        /// Copy, or `None` for a symbol with no book.
        reply: oneshot::Sender<Option<OrderBookState>>,
    },
    /// Query a key's lifecycle phase.
    Phase {
        /// Subscription key.
        key: SubscriptionKey,
        /// Phase.
        reply: oneshot::Sender<SubscriptionPhase>,
    },
}

/// Anything a context task processes.
#[derive(Debug)]
pub enum ContextEvent {
    /// Transport notification.
    Transport(TransportEvent),
    /// Caller command.
    Command(Command),
    /// A subscribe request's timer fired.
    SubscriptionExpired {
        /// Subscription key.
        key: SubscriptionKey,
        /// Request nonce.
        nonce: Nonce,
        /// Timer that fired.
        timer: TimerId,
    },
}

// =============================================================================
// Driver
// =============================================================================

/// Task owning one connection context.
#[derive(Debug)]
pub struct ContextDriver {
    ctx: ConnectionContext,
    dispatcher: Dispatcher,
    coordinator: SubscriptionCoordinator,
    events: mpsc::UnboundedReceiver<ContextEvent>,
}

impl ContextDriver {
    /// Create a driver for `ctx`, consuming `events`.
    #[must_use]
    pub const fn new(
        ctx: ConnectionContext,
        dispatcher: Dispatcher,
        coordinator: SubscriptionCoordinator,
        events: mpsc::UnboundedReceiver<ContextEvent>,
    ) -> Self {
        Self {
            ctx,
            dispatcher,
            coordinator,
            events,
        }
    }

    /// Process events until the transport closes or every handle is dropped.
    ///
    /// The context is torn down exactly once on exit.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            if !self.handle(event) {
                return;
            }
        }

        debug!(context = %self.ctx.id(), "All handles dropped");
        self.dispatcher.on_close(&mut self.ctx);
    }

    /// Handle one event. Returns false once the context is closed.
    fn handle(&mut self, event: ContextEvent) -> bool {
        match event {
            ContextEvent::Transport(TransportEvent::Opened) => self.dispatcher.on_open(&mut self.ctx),
            ContextEvent::Transport(TransportEvent::Frame(raw)) => {
                self.dispatcher.on_frame(&mut self.ctx, &raw);
            }
            ContextEvent::Transport(TransportEvent::Closed) => {
                self.dispatcher.on_close(&mut self.ctx);
                return false;
            }
            ContextEvent::Command(command) => self.execute(command),
            ContextEvent::SubscriptionExpired { key, nonce, timer } => {
                self.coordinator.on_timeout(&mut self.ctx, &key, nonce, timer);
            }
        }
        true
    }

    fn execute(&mut self, command: Command) {
        // Replies are dropped silently when the caller stopped waiting
        match command {
            Command::Subscribe { intent, reply } => {
                let _ = reply.send(self.coordinator.subscribe(&mut self.ctx, intent));
            }
            Command::Unsubscribe { intent, reply } => {
                let _ = reply.send(self.coordinator.unsubscribe(&mut self.ctx, &intent));
            }
            Command::Snapshot {
                symbol,
                depth,
                reply,
            } => {
                let books = self.ctx.books();
                let snapshot = match depth {
                    Some(depth) => books.clone_book(&symbol, Some(depth)),
                    None => books.clone_limited(&symbol),
                };
                let _ = reply.send(snapshot);
            }
            Command::Phase { key, reply } => {
                let _ = reply.send(self.ctx.phase(&key));
            }
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Cloneable handle to a running context.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    id: ContextId,
    events: mpsc::UnboundedSender<ContextEvent>,
}

impl ContextHandle {
    /// Create a handle posting into `events`.
    #[must_use]
    pub const fn new(id: ContextId, events: mpsc::UnboundedSender<ContextEvent>) -> Self {
        Self { id, events }
    }

    /// Context id.
    #[must_use]
    pub const fn id(&self) -> ContextId {
        self.id
    }

    /// Check if the context task has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Register a subscribe request.
    ///
    /// The returned outcome resolves once every required side is
    /// acknowledged, the timer fires, or the context closes.
    ///
    /// # Errors
    ///
    /// Returns synchronous rejections from the coordinator, or
    /// `Transport(Closed)` if the context is gone.
    pub async fn subscribe(
        &self,
        intent: SubscriptionIntent,
    ) -> Result<SubscriptionOutcome, SubscriptionError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Subscribe { intent, reply })?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Subscribe and wait for the final outcome.
    ///
    /// # Errors
    ///
    /// Returns any synchronous rejection, timeout or cancellation.
    pub async fn subscribe_acked(&self, intent: SubscriptionIntent) -> Result<(), SubscriptionError> {
        self.subscribe(intent).await?.await
    }

    /// Drop a subscription.
    ///
    /// # Errors
    ///
    /// Returns coordinator rejections, or `Transport(Closed)` if the context
    /// is gone.
    pub async fn unsubscribe(&self, intent: SubscriptionIntent) -> Result<(), SubscriptionError> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Unsubscribe { intent, reply })?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Copy a symbol's book, truncated to `depth` or the registered limit.
    ///
    /// Returns `None` for a symbol with no book or a closed context.
    pub async fn snapshot(&self, symbol: impl Into<Symbol>, depth: Option<usize>) -> Option<OrderBookState> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Snapshot {
            symbol: symbol.into(),
            depth,
            reply,
        })
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Lifecycle phase of a subscription. A closed context reports
    /// `Unsubscribed`.
    pub async fn phase(&self, kind: EventKind, symbol: impl Into<Symbol>) -> SubscriptionPhase {
        let (reply, rx) = oneshot::channel();
        let key = SubscriptionKey::new(kind, symbol);
        if self.post(Command::Phase { key, reply }).is_err() {
            return SubscriptionPhase::Unsubscribed;
        }
        rx.await.unwrap_or_default()
    }

    /// Deliver an inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the context is gone.
    pub fn deliver_frame(&self, raw: impl Into<String>) -> Result<(), TransportError> {
        self.send(ContextEvent::Transport(TransportEvent::Frame(raw.into())))
    }

    /// Deliver the transport close.
    ///
    /// # Errors
    ///
    /// Returns an error if the context is already gone.
    pub fn deliver_close(&self) -> Result<(), TransportError> {
        self.send(ContextEvent::Transport(TransportEvent::Closed))
    }

    pub(crate) fn deliver_open(&self) -> Result<(), TransportError> {
        self.send(ContextEvent::Transport(TransportEvent::Opened))
    }

    fn post(&self, command: Command) -> Result<(), TransportError> {
        self.send(ContextEvent::Command(command))
    }

    fn send(&self, event: ContextEvent) -> Result<(), TransportError> {
        self.events.send(event).map_err(|_| TransportError::Closed)
    }
}
