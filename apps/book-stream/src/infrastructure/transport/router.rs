//! Outbound Router
//!
//! [`Transport`] implementation shared by every connection. Each live
//! WebSocket registers an outbound queue under its context id; the engine
//! writes frames through the router without knowing which socket they land on.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::application::ports::{Transport, TransportError};
use crate::domain::connection::ContextId;

/// Context id to outbound queue map.
#[derive(Debug, Default)]
pub struct OutboundRouter {
    routes: RwLock<HashMap<ContextId, mpsc::UnboundedSender<String>>>,
}

impl OutboundRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the queue its writer drains.
    pub fn register(&self, context: ContextId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(context, tx);
        rx
    }

    /// Remove a connection. Frames sent afterwards fail with `UnknownContext`.
    pub fn unregister(&self, context: ContextId) -> bool {
        self.routes.write().remove(&context).is_some()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Check if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl Transport for OutboundRouter {
    fn send(&self, context: ContextId, frame: String) -> Result<(), TransportError> {
        let routes = self.routes.read();
        let tx = routes
            .get(&context)
            .ok_or(TransportError::UnknownContext(context))?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_to_registered_queue() {
        let router = OutboundRouter::new();
        let a = ContextId::new();
        let b = ContextId::new();
        let mut rx_a = router.register(a);
        let mut rx_b = router.register(b);

        router.send(a, "to a".into()).unwrap();
        router.send(b, "to b".into()).unwrap();

        assert_eq!(rx_a.try_recv().unwrap(), "to a");
        assert_eq!(rx_b.try_recv().unwrap(), "to b");
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn unknown_and_closed_contexts_fail() {
        let router = OutboundRouter::new();
        let id = ContextId::new();
        assert_eq!(
            router.send(id, "x".into()),
            Err(TransportError::UnknownContext(id))
        );

        let rx = router.register(id);
        drop(rx);
        assert_eq!(router.send(id, "x".into()), Err(TransportError::Closed));

        assert!(router.unregister(id));
        assert!(router.is_empty());
    }
}
