//! WebSocket Connector
//!
//! Owns the raw venue socket. Every successful connection gets a fresh
//! connection context; inbound text frames are delivered to its driver and
//! frames the engine writes through the [`OutboundRouter`] are forwarded to
//! the socket. When the socket drops the context is closed and the connector
//! reconnects with exponential backoff.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::router::OutboundRouter;
use crate::application::services::{ContextHandle, Engine};
use crate::domain::connection::ContextId;
use crate::infrastructure::metrics;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Callback invoked with every newly opened context.
pub type OnConnected = Arc<dyn Fn(ContextHandle) + Send + Sync>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors ending a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded after {0} attempts")]
    MaxReconnectAttemptsExceeded(u32),

    /// Remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The context task exited while the socket was still open.
    #[error("context {0} stopped")]
    ContextStopped(ContextId),
}

// =============================================================================
// Connector
// =============================================================================

/// Connector settings.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Venue WebSocket URL.
    pub url: String,
    /// Backoff between connection attempts.
    pub reconnect: ReconnectConfig,
}

/// Reconnecting WebSocket client feeding an [`Engine`].
pub struct WebSocketConnector {
    config: ConnectorConfig,
    engine: Engine,
    router: Arc<OutboundRouter>,
    cancel: CancellationToken,
    on_connected: OnConnected,
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.config.url)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl WebSocketConnector {
    /// Create a connector. `router` must be the transport `engine` writes to.
    #[must_use]
    pub fn new(
        config: ConnectorConfig,
        engine: Engine,
        router: Arc<OutboundRouter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            engine,
            router,
            cancel,
            on_connected: Arc::new(|_| {}),
        }
    }

    /// Register the callback run for each new context, typically to
    /// (re)subscribe.
    #[must_use]
    pub fn on_connected(mut self, callback: impl Fn(ContextHandle) + Send + Sync + 'static) -> Self {
        self.on_connected = Arc::new(callback);
        self
    }

    /// Connect and reconnect until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `MaxReconnectAttemptsExceeded` once the backoff policy gives up.
    pub async fn run_forever(&self) -> Result<(), ConnectorError> {
        let venue = self.engine.protocol().name();
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                info!(venue, "Connector cancelled");
                return Ok(());
            }

            match self.connect_and_run(&mut policy).await {
                Ok(()) => {
                    info!(venue, "Connection closed gracefully");
                    return Ok(());
                }
                Err(e) => {
                    warn!(venue, error = %e, "Connection lost");

                    let Some(delay) = policy.next_delay() else {
                        return Err(ConnectorError::MaxReconnectAttemptsExceeded(
                            policy.attempt_count(),
                        ));
                    };
                    let attempt = policy.attempt_count();
                    info!(venue, attempt, delay_ms = delay.as_millis(), "Reconnecting");
                    metrics::record_reconnect(venue);

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            info!(venue, "Connector cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run one connection until cancellation or failure.
    async fn connect_and_run(&self, policy: &mut ReconnectPolicy) -> Result<(), ConnectorError> {
        let (socket, _response) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        policy.reset();

        let id = ContextId::new();
        let outbound = self.router.register(id);
        let (handle, driver) = self.engine.open_context_with_id(id);
        info!(context = %id, url = %self.config.url, "Connected");

        (self.on_connected)(handle.clone());

        let result = self.pump(socket, outbound, &handle).await;

        self.router.unregister(id);
        // Already gone when the driver stopped first
        let _ = handle.deliver_close();
        if let Err(e) = driver.await {
            warn!(context = %id, error = %e, "Context driver failed");
        }
        result
    }

    async fn pump(
        &self,
        socket: Socket,
        mut outbound: mpsc::UnboundedReceiver<String>,
        handle: &ContextHandle,
    ) -> Result<(), ConnectorError> {
        let (mut write, mut read) = socket.split();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        return Err(ConnectorError::ContextStopped(handle.id()));
                    };
                    debug!(context = %handle.id(), frame = %frame, "Sending frame");
                    write.send(Message::Text(frame.into())).await?;
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle
                                .deliver_frame(text.as_str())
                                .map_err(|_| ConnectorError::ContextStopped(handle.id()))?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!(context = %handle.id(), ?frame, "Server closed connection");
                            return Err(ConnectorError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            info!(context = %handle.id(), "Stream ended");
                            return Err(ConnectorError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }
}
