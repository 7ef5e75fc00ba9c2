//! Engine
//!
//! Wires a venue dialect, a transport and an event sink into connection
//! contexts. Each [`Engine::open_context`] call creates a fresh context
//! with its own driver task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::context::ConnectionContext;
use super::coordinator::{DEFAULT_SUBSCRIBE_TIMEOUT, SubscriptionCoordinator};
use super::dispatcher::Dispatcher;
use super::driver::{ContextDriver, ContextHandle};
use crate::application::ports::{EventSink, Transport, VenueProtocol};
use crate::domain::connection::ContextId;

/// Engine timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Time to wait for every required acknowledgment.
    pub subscribe_timeout: Duration,
    /// Keep-alive interval override; the dialect default applies when `None`.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            heartbeat_interval: None,
        }
    }
}

/// Factory for connection contexts sharing one dialect and transport.
#[derive(Clone)]
pub struct Engine {
    protocol: Arc<dyn VenueProtocol>,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    settings: EngineSettings,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("venue", &self.protocol.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        protocol: Arc<dyn VenueProtocol>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            protocol,
            transport,
            sink,
            settings,
        }
    }

    /// Active dialect.
    #[must_use]
    pub fn protocol(&self) -> &Arc<dyn VenueProtocol> {
        &self.protocol
    }

    /// Effective keep-alive interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.settings
            .heartbeat_interval
            .or_else(|| self.protocol.capabilities().heartbeat)
    }

    /// Open a context with a fresh id.
    pub fn open_context(&self) -> (ContextHandle, JoinHandle<()>) {
        self.open_context_with_id(ContextId::new())
    }

    /// Open a context with a caller-chosen id.
    ///
    /// The open notification is queued before anything else, so commands
    /// sent through the returned handle always see an opened context.
    pub fn open_context_with_id(&self, id: ContextId) -> (ContextHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = ConnectionContext::new(id, &tx);

        let coordinator = SubscriptionCoordinator::new(
            Arc::clone(&self.protocol),
            Arc::clone(&self.transport),
            self.settings.subscribe_timeout,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.protocol),
            coordinator.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.sink),
            self.heartbeat_interval(),
        );

        let handle = ContextHandle::new(id, tx);
        // Receiver is alive until the driver runs
        let _ = handle.deliver_open();

        let driver = ContextDriver::new(ctx, dispatcher, coordinator, rx);
        (handle, tokio::spawn(driver.run()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{EngineEvent, MockTransport};
    use crate::domain::subscription::{EventKind, SubscriptionPhase};
    use crate::infrastructure::venue::VenueKind;

    fn engine(
        venue: VenueKind,
        settings: EngineSettings,
    ) -> (Engine, mpsc::UnboundedReceiver<EngineEvent>) {
        let mut transport = MockTransport::new();
        transport.expect_send().returning(|_, _| Ok(()));
        let (sink, events) = mpsc::unbounded_channel::<EngineEvent>();
        let engine = Engine::new(
            venue.protocol(&[]),
            Arc::new(transport),
            Arc::new(sink),
            settings,
        );
        (engine, events)
    }

    #[test]
    fn heartbeat_interval_prefers_override() {
        let (okex, _) = engine(VenueKind::Okex, EngineSettings::default());
        assert_eq!(okex.heartbeat_interval(), Some(Duration::from_secs(30)));

        let (liquid, _) = engine(VenueKind::Liquid, EngineSettings::default());
        assert_eq!(liquid.heartbeat_interval(), None);

        let settings = EngineSettings {
            heartbeat_interval: Some(Duration::from_secs(5)),
            ..EngineSettings::default()
        };
        let (liquid, _) = engine(VenueKind::Liquid, settings);
        assert_eq!(liquid.heartbeat_interval(), Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn contexts_are_independent() {
        let (engine, mut events) = engine(VenueKind::Liquid, EngineSettings::default());
        let (a, a_driver) = engine.open_context();
        let (b, _b_driver) = engine.open_context();
        assert_ne!(a.id(), b.id());

        a.deliver_close().unwrap();
        a_driver.await.unwrap();

        assert!(matches!(events.recv().await, Some(EngineEvent::Closed { context }) if context == a.id()));
        assert!(a.is_closed());
        assert!(!b.is_closed());
        assert_eq!(
            b.phase(EventKind::OrderBook, "BTC/USD").await,
            SubscriptionPhase::Unsubscribed
        );
    }

    #[tokio::test]
    async fn dropping_every_handle_tears_down_the_context() {
        let (engine, mut events) = engine(VenueKind::Liquid, EngineSettings::default());
        let (handle, driver) = engine.open_context();
        let id = handle.id();

        drop(handle);
        driver.await.unwrap();

        assert!(matches!(events.recv().await, Some(EngineEvent::Closed { context }) if context == id));
    }
}
