//! Supervisor wiring.
//!
//! Owns the registry, one control channel per worker, the tracing
//! controller, and the upstream channel external observers attach to. The
//! upstream channel is the dispatch point: status broadcasts and validated
//! trace records flow up it, cluster-wide tracing toggles arrive down it.
//!
//! Process lifecycle stays outside: the embedding layer spawns worker
//! processes and hands their pipes to [`Supervisor::attach_worker`]. When a
//! worker's channel closes, its pending requests resolve as closed and its
//! registry entry is dropped; everything else keeps running.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::channel::{ControlChannel, Inbound};
use crate::bridge::protocol::{ControlMessage, WorkerId};
use crate::config::SupervisorConfig;
use crate::controller::{ControlError, TracingController};
use crate::registry::WorkerRegistry;
use crate::reporter::StatusReporter;
use crate::trace::TraceRecord;

pub struct Supervisor {
    config: SupervisorConfig,
    registry: Arc<WorkerRegistry>,
    channels: Arc<DashMap<WorkerId, ControlChannel>>,
    controller: Arc<TracingController>,
    upstream: ControlChannel,
    reporter_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl Supervisor {
    /// Wire the supervisor to its upstream controller and start the status
    /// broadcast. Must be called from within a tokio runtime.
    pub fn spawn<R, W>(config: SupervisorConfig, upstream_reader: R, upstream_writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let registry = Arc::new(WorkerRegistry::new());
        let channels: Arc<DashMap<WorkerId, ControlChannel>> = Arc::new(DashMap::new());
        let controller = Arc::new(TracingController::new(
            Arc::clone(&registry),
            Arc::clone(&channels),
        ));

        let (events_tx, events_rx) = mpsc::channel(64);
        let upstream = ControlChannel::spawn(upstream_reader, upstream_writer, events_tx);

        let dispatch_task = tokio::spawn(upstream_dispatch(
            events_rx,
            upstream.clone(),
            Arc::clone(&controller),
        ));

        let reporter = StatusReporter::new(Arc::clone(&registry), upstream.clone());
        let reporter_task = reporter.spawn(config.status_interval);

        Self {
            config,
            registry,
            channels,
            controller,
            upstream,
            reporter_task,
            dispatch_task,
        }
    }

    /// Register a worker and take over its control channel.
    ///
    /// The process handle stays with the external lifecycle layer; the
    /// supervisor only owns the channel. Initial tracing state follows the
    /// trace-at-launch configuration flag.
    pub fn attach_worker<R, W>(&self, id: WorkerId, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.registry.register(id, self.config.trace_at_launch);

        let (events_tx, events_rx) = mpsc::channel(64);
        let channel =
            ControlChannel::spawn_with_timeout(reader, writer, events_tx, self.config.request_timeout);
        self.channels.insert(id, channel.clone());
        tracing::info!(%id, "worker attached");

        tokio::spawn(worker_dispatch(
            id,
            events_rx,
            channel,
            Arc::clone(&self.registry),
            Arc::clone(&self.channels),
            self.upstream.clone(),
        ));
    }

    /// Toggle tracing for one worker. See [`TracingController::set_tracing`].
    pub async fn set_tracing(&self, id: WorkerId, enabled: bool) -> Result<(), ControlError> {
        self.controller.set_tracing(id, enabled).await
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Stop the status broadcast and upstream dispatch. Worker channels
    /// wind down on their own when their transports close.
    pub fn shutdown(&self) {
        self.reporter_task.abort();
        self.dispatch_task.abort();
    }
}

/// Handle traffic arriving from the upstream controller.
async fn upstream_dispatch(
    mut events: mpsc::Receiver<Inbound>,
    upstream: ControlChannel,
    controller: Arc<TracingController>,
) {
    while let Some(event) = events.recv().await {
        match event {
            Inbound::SetTracing { token, enabled } => {
                let error = controller
                    .set_all_tracing(enabled)
                    .await
                    .err()
                    .map(|e| e.to_string());
                if upstream.respond_tracing(token, error).await.is_err() {
                    break;
                }
            }
            Inbound::Status { id, .. } => {
                tracing::warn!(%id, "unexpected status frame from upstream");
            }
            Inbound::Trace { .. } => {
                tracing::warn!("unexpected trace frame from upstream");
            }
            Inbound::Closed => break,
        }
    }
    tracing::debug!("upstream dispatch exiting");
}

/// Handle traffic arriving from one worker.
async fn worker_dispatch(
    id: WorkerId,
    mut events: mpsc::Receiver<Inbound>,
    channel: ControlChannel,
    registry: Arc<WorkerRegistry>,
    channels: Arc<DashMap<WorkerId, ControlChannel>>,
    upstream: ControlChannel,
) {
    while let Some(event) = events.recv().await {
        match event {
            Inbound::Status { id: reported, is_tracing } => {
                tracing::debug!(%id, %reported, is_tracing, "worker heartbeat");
                registry.touch(id);
            }
            Inbound::Trace { record } => match TraceRecord::decode(&record) {
                Ok(_) => {
                    if upstream
                        .send(ControlMessage::TraceObject { record })
                        .await
                        .is_err()
                    {
                        tracing::debug!(%id, "upstream closed, dropping trace record");
                    }
                }
                Err(e) => {
                    // Malformed records are dropped, never forwarded.
                    tracing::warn!(%id, error = %e, "discarding undecodable trace record");
                }
            },
            Inbound::SetTracing { token, enabled } => {
                tracing::warn!(%id, enabled, "tracing request from worker rejected");
                let _ = channel
                    .respond_tracing(
                        token,
                        Some("tracing requests are not accepted from workers".to_string()),
                    )
                    .await;
            }
            Inbound::Closed => break,
        }
    }
    channels.remove(&id);
    registry.remove(id);
    tracing::info!(%id, "worker detached");
}
