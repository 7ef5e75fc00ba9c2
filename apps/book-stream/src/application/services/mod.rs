//! Application Services
//!
//! Services that drive the subscription lifecycle for connection contexts.
//!
//! - `SubscriptionCoordinator`: correlates requests with acknowledgments
//! - `Dispatcher`: classifies and routes inbound frames
//! - `HeartbeatManager`: per-context keep-alive timer
//! - `ContextDriver` / `ContextHandle`: the per-context task and its handle
//! - `Engine`: wires dialect, transport and sink into contexts

pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod driver;
pub mod engine;
pub mod heartbeat;

pub use context::{ConnectionContext, PendingEntry, PendingSet, TimerHandle, TimerScheduler};
pub use coordinator::{
    DEFAULT_SUBSCRIBE_TIMEOUT, SubscriptionCoordinator, SubscriptionError, SubscriptionOutcome,
    SubscriptionResult,
};
pub use dispatcher::Dispatcher;
pub use driver::{Command, ContextDriver, ContextEvent, ContextHandle, TransportEvent};
pub use engine::{Engine, EngineSettings};
pub use heartbeat::{HeartbeatHandle, HeartbeatManager};
