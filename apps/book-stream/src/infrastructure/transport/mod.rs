//! WebSocket Transport
//!
//! - [`router::OutboundRouter`]: the [`Transport`](crate::application::ports::Transport)
//!   shared by all connections
//! - [`websocket::WebSocketConnector`]: socket ownership and reconnects
//! - [`reconnect::ReconnectPolicy`]: backoff between attempts

pub mod reconnect;
pub mod router;
pub mod websocket;

pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use router::OutboundRouter;
pub use websocket::{ConnectorConfig, ConnectorError, OnConnected, WebSocketConnector};
