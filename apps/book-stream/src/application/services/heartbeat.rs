//! Heartbeat Manager
//!
//! Keeps a connection alive by invoking a send callback at a fixed interval.
//! One timer per context; starting a new one replaces the old.

use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::context::ConnectionContext;
use crate::domain::connection::ContextId;

/// Handle to a running heartbeat timer. Dropping it stops the timer.
#[derive(Debug)]
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    interval: Duration,
}

impl HeartbeatHandle {
    /// Timer interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts and stops per-context heartbeat timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatManager;

impl HeartbeatManager {
    /// Arm a periodic timer calling `send` every `interval`, first tick
    /// after one full interval. Any existing timer is cancelled first.
    pub fn start<F>(context: &mut ConnectionContext, interval: Duration, send: F)
    where
        F: Fn(ContextId) + Send + 'static,
    {
        Self::stop(context);

        let cancel = CancellationToken::new();
        let task = HeartbeatTask {
            context: context.id(),
            interval,
            send,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        tracing::debug!(
            context = %context.id(),
            interval_secs = interval.as_secs_f64(),
            "Heartbeat started"
        );
        context.heartbeat = Some(HeartbeatHandle { cancel, interval });
    }

    /// Cancel the context's timer. Returns true if one was running.
    pub fn stop(context: &mut ConnectionContext) -> bool {
        context.heartbeat.take().is_some_and(|handle| {
            handle.stop();
            tracing::debug!(context = %context.id(), "Heartbeat stopped");
            true
        })
    }
}

struct HeartbeatTask<F> {
    context: ContextId,
    interval: Duration,
    send: F,
    cancel: CancellationToken,
}

impl<F> HeartbeatTask<F>
where
    F: Fn(ContextId) + Send + 'static,
{
    async fn run(self) {
        let mut ticks = interval_at(tokio::time::Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::trace!(context = %self.context, "Heartbeat task cancelled");
                    break;
                }
                _ = ticks.tick() => {
                    (self.send)(self.context);
                }
            }
        }
    }
}
