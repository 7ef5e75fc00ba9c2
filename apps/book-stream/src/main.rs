//! Book Stream Binary
//!
//! Connects to one venue, subscribes the configured symbols on every
//! connection and logs book updates.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin book-stream
//! ```
//!
//! # Environment Variables
//!
//! - `BOOK_STREAM_VENUE`: okex | liquid (default: okex)
//! - `BOOK_STREAM_URL`: WebSocket endpoint (default: the venue's)
//! - `BOOK_STREAM_SYMBOLS`: Comma separated symbols (default: BTC/USDT)
//! - `BOOK_STREAM_DEPTH`: Levels per side in notifications (default: unlimited)
//! - `BOOK_STREAM_CONTRACT_TYPE`: OKEx futures contract type (default: spot)
//! - `BOOK_STREAM_SUBSCRIBE_TIMEOUT_MS`: Acknowledgment timeout (default: 10000)
//! - `BOOK_STREAM_HEARTBEAT_INTERVAL_SECS`: Keep-alive override (default: venue's)
//! - `BOOK_STREAM_METRICS_PORT`: Prometheus metrics port (default: 9091, 0 disables)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: book-stream)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use book_stream::infrastructure::telemetry;
use book_stream::infrastructure::transport::{ConnectorError, WebSocketConnector};
use book_stream::{
    ContextHandle, Engine, EngineConfig, EngineEvent, OutboundRouter, SubscribeOptions,
    SubscriptionIntent, Symbol, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting Book Stream");

    let config = EngineConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    if config.metrics_port != 0 {
        match init_metrics(config.metrics_port) {
            Ok(addr) => tracing::info!(addr = %addr, "Metrics exporter listening"),
            Err(e) => tracing::warn!(error = %e, "Metrics exporter disabled"),
        }
    }

    let shutdown_token = CancellationToken::new();

    let protocol = config.venue.protocol(&config.symbols);
    let router = Arc::new(OutboundRouter::new());
    let (event_tx, event_rx) = mpsc::unbounded_channel::<EngineEvent>();
    let engine = Engine::new(
        protocol,
        Arc::clone(&router) as Arc<dyn book_stream::Transport>,
        Arc::new(event_tx),
        config.engine_settings(),
    );

    tokio::spawn(log_events(event_rx));

    let subscriber = Subscriber {
        symbols: config.symbols.clone(),
        options: config.options.clone(),
        nonces: Arc::new(AtomicU64::new(1)),
    };
    let connector = WebSocketConnector::new(
        config.connector_config(),
        engine,
        router,
        shutdown_token.clone(),
    )
    .on_connected(move |handle| subscriber.subscribe_all(&handle));

    let mut connector_task = tokio::spawn(async move { connector.run_forever().await });

    tracing::info!("Book stream ready");

    let finished = tokio::select! {
        () = await_shutdown(shutdown_token.clone()) => None,
        joined = &mut connector_task => Some(joined),
    };

    let joined = match finished {
        Some(joined) => {
            shutdown_token.cancel();
            joined
        }
        None => match tokio::time::timeout(SHUTDOWN_TIMEOUT, connector_task).await {
            Ok(joined) => joined,
            Err(_) => {
                tracing::warn!("Connector did not stop in time");
                return Ok(());
            }
        },
    };
    report_connector(joined.context("connector task panicked")?)?;

    tracing::info!("Book stream stopped");
    Ok(())
}

/// Subscribes the configured symbols on each new connection.
struct Subscriber {
    symbols: Vec<Symbol>,
    options: SubscribeOptions,
    nonces: Arc<AtomicU64>,
}

impl Subscriber {
    fn subscribe_all(&self, handle: &ContextHandle) {
        for symbol in &self.symbols {
            let nonce = self.nonces.fetch_add(1, Ordering::Relaxed);
            let intent =
                SubscriptionIntent::order_book(symbol.clone(), nonce).with_options(self.options.clone());
            let handle = handle.clone();
            let symbol = symbol.clone();

            tokio::spawn(async move {
                match handle.subscribe_acked(intent).await {
                    Ok(()) => tracing::info!(context = %handle.id(), symbol = %symbol, nonce, "Subscribed"),
                    Err(e) => tracing::warn!(
                        context = %handle.id(),
                        symbol = %symbol,
                        nonce,
                        error = %e,
                        "Subscription failed"
                    ),
                }
            });
        }
    }
}

/// Log engine events until the engine is dropped.
async fn log_events(mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::BookUpdated {
                context,
                symbol,
                snapshot,
            } => {
                tracing::debug!(
                    context = %context,
                    symbol = %symbol,
                    best_bid = ?snapshot.best_bid().map(|l| l.price),
                    best_ask = ?snapshot.best_ask().map(|l| l.price),
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    "Book updated"
                );
            }
            EngineEvent::ProtocolError {
                context,
                category,
                message,
            } => {
                tracing::warn!(context = %context, category, error = %message, "Protocol error");
            }
            EngineEvent::VenueError {
                context,
                channel,
                message,
            } => {
                tracing::error!(context = %context, channel = ?channel, error = %message, "Venue error");
            }
            EngineEvent::Closed { context } => {
                tracing::info!(context = %context, "Context closed");
            }
        }
    }
}

fn report_connector(result: Result<(), ConnectorError>) -> anyhow::Result<()> {
    result.context("connector stopped")
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &EngineConfig) {
    tracing::info!(
        venue = config.venue.as_str(),
        url = %config.url,
        symbols = ?config.symbols,
        depth = ?config.options.depth,
        subscribe_timeout_ms = config.subscribe_timeout.as_millis(),
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
