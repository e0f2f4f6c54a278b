//! Tracing state machine.
//!
//! Each worker is either tracing or not; the only transitions are explicit
//! toggle requests. The registry is committed before a successful result is
//! surfaced, so every status broadcast emitted after the caller observes
//! success already reflects the new state. On any failure the registry is
//! left untouched; there are no automatic retries.

use std::sync::Arc;

use dashmap::DashMap;

use crate::bridge::channel::{ChannelError, ControlChannel};
use crate::bridge::protocol::WorkerId;
use crate::registry::WorkerRegistry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    /// The target id was never registered. Nothing goes on the wire.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// The worker exited before responding.
    #[error("control channel closed")]
    ChannelClosed,

    /// No response within the configured deadline.
    #[error("tracing request timed out")]
    RequestTimeout,

    /// The worker-side instrumentation refused the toggle. Registry state
    /// is unchanged.
    #[error("tracing change refused: {0}")]
    Refused(String),
}

impl From<ChannelError> for ControlError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => ControlError::ChannelClosed,
            ChannelError::Timeout => ControlError::RequestTimeout,
        }
    }
}

pub struct TracingController {
    registry: Arc<WorkerRegistry>,
    channels: Arc<DashMap<WorkerId, ControlChannel>>,
}

impl TracingController {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        channels: Arc<DashMap<WorkerId, ControlChannel>>,
    ) -> Self {
        Self { registry, channels }
    }

    /// Toggle tracing for one worker.
    ///
    /// Worker 0 always succeeds without changing anything. For real workers
    /// the toggle is forwarded over the control channel; the registry is
    /// updated only on an error-free reply, and before this call returns.
    pub async fn set_tracing(&self, id: WorkerId, enabled: bool) -> Result<(), ControlError> {
        if !self.registry.contains(id) {
            return Err(ControlError::UnknownWorker(id));
        }
        if id.is_supervisor() {
            tracing::debug!(%id, "tracing toggle for the supervisor entry is a no-op");
            return Ok(());
        }

        let channel = self
            .channels
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(ControlError::ChannelClosed)?;

        let reply = channel.request_tracing(enabled).await?;
        if let Some(error) = reply.error {
            tracing::warn!(%id, %error, "worker refused tracing change");
            return Err(ControlError::Refused(error));
        }

        // Commit before the caller can observe success.
        self.registry
            .set_tracing(id, enabled)
            .map_err(|_| ControlError::UnknownWorker(id))?;
        tracing::info!(%id, enabled, "tracing state changed");
        Ok(())
    }

    /// Cluster-wide toggle, as issued by an upstream controller.
    ///
    /// Worker 0 is skipped. Every worker still gets the request even when an
    /// earlier one fails; the first failure is what gets reported.
    pub async fn set_all_tracing(&self, enabled: bool) -> Result<(), ControlError> {
        let mut first_error = None;
        for status in self.registry.all() {
            if status.id.is_supervisor() {
                continue;
            }
            if let Err(e) = self.set_tracing(status.id, enabled).await {
                tracing::warn!(id = %status.id, error = %e, "cluster tracing toggle failed for worker");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
