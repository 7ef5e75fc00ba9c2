//! Frame Dispatcher
//!
//! Decodes inbound frames through the active dialect and routes each
//! classified frame: acks to the coordinator, depth data to the order-book
//! store, venue errors to the event sink. Protocol errors are reported and
//! never close the connection.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use super::context::ConnectionContext;
use super::coordinator::SubscriptionCoordinator;
use super::heartbeat::HeartbeatManager;
use crate::application::ports::{EngineEvent, EventSink, Transport, VenueProtocol};
use crate::domain::frame::{BookPayload, InboundFrame, ProtocolError};
use crate::domain::order_book::ApplyOutcome;
use crate::infrastructure::metrics;

/// Routes inbound traffic for connection contexts.
#[derive(Clone)]
pub struct Dispatcher {
    protocol: Arc<dyn VenueProtocol>,
    coordinator: SubscriptionCoordinator,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    heartbeat_interval: Option<Duration>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("venue", &self.protocol.name())
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// `heartbeat_interval` of `None` disables keep-alive even when the
    /// dialect defines a ping frame.
    #[must_use]
    pub fn new(
        protocol: Arc<dyn VenueProtocol>,
        coordinator: SubscriptionCoordinator,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        heartbeat_interval: Option<Duration>,
    ) -> Self {
        Self {
            protocol,
            coordinator,
            transport,
            sink,
            heartbeat_interval,
        }
    }

    /// Reset channel state and arm the heartbeat.
    pub fn on_open(&self, ctx: &mut ConnectionContext) {
        ctx.channels.clear();
        ctx.retired.clear();

        if let (Some(interval), Some(frame)) =
            (self.heartbeat_interval, self.protocol.encode_heartbeat())
        {
            let transport = Arc::clone(&self.transport);
            let venue = self.protocol.name();
            HeartbeatManager::start(ctx, interval, move |context| {
                match transport.send(context, frame.clone()) {
                    Ok(()) => metrics::record_heartbeat(venue),
                    Err(e) => debug!(%context, error = %e, "Heartbeat not sent"),
                }
            });
        }

        info!(
            context = %ctx.id(),
            venue = self.protocol.name(),
            heartbeat = ctx.has_heartbeat(),
            "Connection context opened"
        );
    }

    /// Decode and route one raw inbound message.
    pub fn on_frame(&self, ctx: &mut ConnectionContext, raw: &str) {
        let frames = match self.protocol.decode(raw) {
            Ok(frames) => frames,
            Err(e) => {
                self.report(ctx, &e, raw);
                return;
            }
        };

        for frame in frames {
            metrics::record_frame(self.protocol.name(), frame.kind());
            if let Err(e) = self.route(ctx, frame) {
                self.report(ctx, &e, raw);
            }
        }
    }

    /// Cancel pending requests, stop the heartbeat and drop all state.
    pub fn on_close(&self, ctx: &mut ConnectionContext) {
        let cancelled = self.coordinator.cancel_all(ctx);
        HeartbeatManager::stop(ctx);
        ctx.channels.clear();
        ctx.retired.clear();
        ctx.confirmed.clear();
        ctx.books.clear();

        info!(context = %ctx.id(), cancelled, "Connection context closed");
        self.sink.emit(EngineEvent::Closed { context: ctx.id() });
    }

    fn route(&self, ctx: &mut ConnectionContext, frame: InboundFrame) -> Result<(), ProtocolError> {
        match frame {
            InboundFrame::SubscriptionAck { channel, sides } => {
                self.coordinator.on_ack(ctx, &channel, sides);
            }
            InboundFrame::UnsubscribeAck { channel } => {
                self.coordinator.on_unsubscribe_ack(ctx, &channel);
            }
            InboundFrame::BookUpdate { channel, payload } => {
                self.apply_book(ctx, &channel, payload)?;
            }
            InboundFrame::Error { channel, message } => {
                warn!(context = %ctx.id(), channel = ?channel, %message, "Venue error");
                self.sink.emit(EngineEvent::VenueError {
                    context: ctx.id(),
                    channel,
                    message,
                });
            }
            InboundFrame::Pong => trace!(context = %ctx.id(), "Pong"),
            InboundFrame::Ignored => trace!(context = %ctx.id(), "Frame ignored"),
        }
        Ok(())
    }

    fn apply_book(
        &self,
        ctx: &mut ConnectionContext,
        channel: &str,
        payload: BookPayload,
    ) -> Result<(), ProtocolError> {
        if ctx.is_retired(channel) {
            debug!(context = %ctx.id(), channel, "Data for unsubscribed channel dropped");
            return Ok(());
        }

        let venue = self.protocol.name();
        let caps = self.protocol.capabilities();
        let allowed = match &payload {
            BookPayload::Side { .. } => caps.full_replace,
            BookPayload::Snapshot { .. } => caps.snapshot,
            BookPayload::Incremental(_) => caps.incremental,
        };
        if !allowed {
            return Err(ProtocolError::UnsupportedPayload {
                shape: payload.shape(),
                venue,
            });
        }

        let symbol = ctx
            .channels
            .symbol_for(channel)
            .cloned()
            .or_else(|| self.protocol.symbol_for_channel(channel))
            .ok_or_else(|| ProtocolError::UnknownChannel(channel.to_string()))?;
        let shape = payload.shape();

        match payload {
            BookPayload::Side { side, levels } => {
                ctx.books.apply_full_replace(&symbol, side, &levels);
            }
            BookPayload::Snapshot {
                bids,
                asks,
                sequence,
                timestamp,
            } => {
                ctx.books
                    .apply_snapshot(&symbol, &bids, &asks, sequence, timestamp);
            }
            BookPayload::Incremental(update) => {
                if let ApplyOutcome::Stale { last, received } =
                    ctx.books.apply_incremental(&symbol, &update)
                {
                    debug!(context = %ctx.id(), %symbol, last, received, "Stale update dropped");
                    metrics::record_stale_update(venue);
                    return Ok(());
                }
            }
        }

        metrics::record_book_update(venue, shape);
        if let Some(snapshot) = ctx.books.clone_limited(&symbol) {
            trace!(
                context = %ctx.id(),
                %symbol,
                bids = snapshot.bids.len(),
                asks = snapshot.asks.len(),
                "Book updated"
            );
            self.sink.emit(EngineEvent::BookUpdated {
                context: ctx.id(),
                symbol,
                snapshot,
            });
        }
        Ok(())
    }

    fn report(&self, ctx: &ConnectionContext, error: &ProtocolError, raw: &str) {
        let venue = self.protocol.name();
        warn!(
            context = %ctx.id(),
            venue,
            error = %error,
            payload_len = raw.len(),
            "Protocol error"
        );
        metrics::record_protocol_error(venue, error.category());
        self.sink.emit(EngineEvent::ProtocolError {
            context: ctx.id(),
            category: error.category(),
            message: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::ports::MockTransport;
    use crate::application::services::driver::ContextEvent;
    use crate::domain::connection::ContextId;
    use crate::infrastructure::venue::VenueKind;

    const BUY_LADDER: &str =
        r#"{"event":"updated","channel":"price_ladders_cash_btcusd_buy","data":"[[\"7000\",\"1\"]]"}"#;

    struct Fixture {
        dispatcher: Dispatcher,
        ctx: ConnectionContext,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        _queue: mpsc::UnboundedSender<ContextEvent>,
    }

    fn fixture() -> Fixture {
        let protocol = VenueKind::Liquid.protocol(&["BTC/USD".to_string()]);
        let mut transport = MockTransport::new();
        transport.expect_send().returning(|_, _| Ok(()));
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let (sink, events) = mpsc::unbounded_channel::<EngineEvent>();
        let coordinator = SubscriptionCoordinator::new(
            Arc::clone(&protocol),
            Arc::clone(&transport),
            Duration::from_secs(1),
        );
        let (queue, _rx) = mpsc::unbounded_channel();

        Fixture {
            dispatcher: Dispatcher::new(protocol, coordinator, transport, Arc::new(sink), None),
            ctx: ConnectionContext::new(ContextId::new(), &queue),
            events,
            _queue: queue,
        }
    }

    #[tokio::test]
    async fn unbound_ladder_resolves_through_market_map() {
        let mut f = fixture();
        f.dispatcher.on_frame(&mut f.ctx, BUY_LADDER);

        let Ok(EngineEvent::BookUpdated { symbol, snapshot, .. }) = f.events.try_recv() else {
            panic!("expected book update");
        };
        assert_eq!(symbol, "BTC/USD");
        assert_eq!(snapshot.bids.len(), 1);
    }

    #[tokio::test]
    async fn retired_channel_data_is_dropped() {
        let mut f = fixture();
        f.ctx.retired.insert("price_ladders_cash_btcusd_buy".into());

        f.dispatcher.on_frame(&mut f.ctx, BUY_LADDER);

        assert!(f.events.try_recv().is_err());
        assert!(f.ctx.books().clone_book("BTC/USD", None).is_none());
    }

    #[tokio::test]
    async fn malformed_frame_is_reported() {
        let mut f = fixture();
        f.dispatcher.on_frame(&mut f.ctx, "{not json");

        let Ok(EngineEvent::ProtocolError { category, .. }) = f.events.try_recv() else {
            panic!("expected protocol error");
        };
        assert_eq!(category, "json");
    }

    #[tokio::test]
    async fn close_clears_state_and_notifies() {
        let mut f = fixture();
        f.dispatcher.on_open(&mut f.ctx);
        f.dispatcher.on_frame(&mut f.ctx, BUY_LADDER);
        f.ctx.retired.insert("price_ladders_cash_btcusd_sell".into());
        let _ = f.events.try_recv();

        f.dispatcher.on_close(&mut f.ctx);

        assert!(f.ctx.books().is_empty());
        assert!(!f.ctx.is_retired("price_ladders_cash_btcusd_sell"));
        assert!(matches!(f.events.try_recv(), Ok(EngineEvent::Closed { .. })));
    }
}
