//! Periodic status broadcast.
//!
//! At every tick, one `status` frame per registry entry goes up the
//! supervisor's upstream channel. Statuses are generated from registry
//! truth at send time, never from a cached copy, so a committed tracing
//! toggle is visible in the very next tick. Frames for a given worker are
//! emitted in generation order; nothing is implied across workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::channel::ControlChannel;
use crate::bridge::protocol::ControlMessage;
use crate::registry::WorkerRegistry;

pub struct StatusReporter {
    registry: Arc<WorkerRegistry>,
    upstream: ControlChannel,
}

impl StatusReporter {
    pub fn new(registry: Arc<WorkerRegistry>, upstream: ControlChannel) -> Self {
        Self { registry, upstream }
    }

    /// Emit one status frame for every current registry entry.
    ///
    /// The snapshot fixes the iteration order only; each entry is re-read
    /// immediately before its frame is handed off, so a toggle committed
    /// while earlier frames were in flight is reflected, not broadcast
    /// stale. Returns `false` once the upstream channel has closed.
    pub async fn tick(&self) -> bool {
        for worker in self.registry.all() {
            // The entry may have been toggled or removed since the
            // snapshot was taken.
            let Ok(current) = self.registry.get(worker.id) else {
                continue;
            };
            let msg = ControlMessage::Status {
                id: current.id,
                is_tracing: current.is_tracing,
            };
            if self.upstream.send(msg).await.is_err() {
                tracing::debug!("upstream channel closed, stopping status broadcast");
                return false;
            }
            self.registry.touch(current.id);
        }
        true
    }

    /// Broadcast at `interval` until the upstream channel closes. The
    /// first tick fires immediately.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if !self.tick().await {
                    break;
                }
            }
        })
    }
}
