//! Worker-side endpoint of the control channel.
//!
//! Runs inside the worker process. The endpoint loop receives tracing
//! toggles from the supervisor and applies them through the [`TraceAgent`]
//! seam; the instrumentation layer pushes captured events through a
//! [`WorkerSender`], which wraps them in the trace envelope before they go
//! on the wire.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::channel::{ChannelError, ControlChannel, Inbound};
use crate::bridge::protocol::{ControlMessage, WorkerId};
use crate::trace::{RecordEncodingError, TraceRecordEncoder};

/// Failure reported by the instrumentation layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct AgentError(String);

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Seam to the in-process instrumentation layer.
///
/// The supervisor only ever learns about a toggle through the returned
/// result; an error here leaves supervisor-side state untouched.
#[async_trait::async_trait]
pub trait TraceAgent: Send + Sync + 'static {
    /// Turn trace capture on or off.
    async fn set_enabled(&self, enabled: bool) -> Result<(), AgentError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Encoding(#[from] RecordEncodingError),
}

/// Handle for pushing telemetry from inside the worker.
#[derive(Clone)]
pub struct WorkerSender {
    id: WorkerId,
    channel: ControlChannel,
    encoder: Arc<TraceRecordEncoder>,
}

impl WorkerSender {
    /// Encode a raw captured event and push it to the supervisor.
    ///
    /// A malformed event fails here and is dropped; it never goes on the
    /// wire half-parsed.
    pub async fn send_trace(&self, raw: serde_json::Value) -> Result<(), WorkerError> {
        let record = self.encoder.encode(raw)?.to_wire()?;
        self.channel
            .send(ControlMessage::TraceObject { record })
            .await?;
        Ok(())
    }

    /// Report this worker's own view of its tracing flag (liveness
    /// heartbeat on the supervisor side).
    pub async fn send_status(&self, is_tracing: bool) -> Result<(), WorkerError> {
        self.channel
            .send(ControlMessage::Status {
                id: self.id,
                is_tracing,
            })
            .await?;
        Ok(())
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }
}

/// Configuration handed to the worker endpoint at spawn time.
///
/// The values mirror the supervisor's startup configuration; the external
/// lifecycle layer is responsible for passing them down.
#[derive(Debug, Clone)]
pub struct WorkerEndpointConfig {
    pub id: WorkerId,
    /// Replaces the real hostname in trace records when set.
    pub host_id_override: Option<String>,
    /// Enable capture immediately instead of waiting for a toggle.
    pub trace_at_launch: bool,
}

/// Run the worker-side control loop until the supervisor hangs up.
///
/// Returns the telemetry handle alongside the running loop's join handle.
pub fn spawn_worker_endpoint<R, W>(
    config: WorkerEndpointConfig,
    reader: R,
    writer: W,
    agent: Arc<dyn TraceAgent>,
) -> (WorkerSender, JoinHandle<()>)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (events_tx, events_rx) = mpsc::channel(64);
    let channel = ControlChannel::spawn(reader, writer, events_tx);
    let encoder = Arc::new(TraceRecordEncoder::new(config.host_id_override.as_deref()));

    let sender = WorkerSender {
        id: config.id,
        channel: channel.clone(),
        encoder,
    };

    let id = config.id;
    let trace_at_launch = config.trace_at_launch;
    let handle = tokio::spawn(async move {
        endpoint_loop(id, trace_at_launch, channel, events_rx, agent).await;
    });

    (sender, handle)
}

async fn endpoint_loop(
    id: WorkerId,
    trace_at_launch: bool,
    channel: ControlChannel,
    mut events: mpsc::Receiver<Inbound>,
    agent: Arc<dyn TraceAgent>,
) {
    if trace_at_launch {
        if let Err(e) = agent.set_enabled(true).await {
            tracing::warn!(%id, error = %e, "failed to enable tracing at launch");
        }
    }

    while let Some(event) = events.recv().await {
        match event {
            Inbound::SetTracing { token, enabled } => {
                let error = agent
                    .set_enabled(enabled)
                    .await
                    .err()
                    .map(|e| e.to_string());
                if let Some(ref error) = error {
                    tracing::warn!(%id, enabled, %error, "instrumentation refused tracing toggle");
                }
                if channel.respond_tracing(token, error).await.is_err() {
                    break;
                }
            }
            Inbound::Status { .. } | Inbound::Trace { .. } => {
                tracing::warn!(%id, "unexpected downstream frame on worker endpoint");
            }
            Inbound::Closed => break,
        }
    }
    tracing::debug!(%id, "worker endpoint exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::TracingReply;
    use crate::trace::TraceRecord;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    /// Test double for the instrumentation layer: records toggles and can
    /// be told to refuse them.
    struct RecordingAgent {
        toggles: Mutex<Vec<bool>>,
        refuse: AtomicBool,
    }

    impl RecordingAgent {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                toggles: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl TraceAgent for RecordingAgent {
        async fn set_enabled(&self, enabled: bool) -> Result<(), AgentError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(AgentError::new("tracing requires a license"));
            }
            self.toggles.lock().await.push(enabled);
            Ok(())
        }
    }

    struct Harness {
        supervisor: ControlChannel,
        supervisor_events: mpsc::Receiver<Inbound>,
        sender: WorkerSender,
        agent: Arc<RecordingAgent>,
    }

    fn harness(config: WorkerEndpointConfig) -> Harness {
        let (a, b) = tokio::io::duplex(8192);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let (sup_tx, supervisor_events) = mpsc::channel(64);
        let supervisor = ControlChannel::spawn(ar, aw, sup_tx);
        let agent = RecordingAgent::new();
        let (sender, _loop) = spawn_worker_endpoint(config, br, bw, Arc::clone(&agent) as _);
        Harness {
            supervisor,
            supervisor_events,
            sender,
            agent,
        }
    }

    fn default_config() -> WorkerEndpointConfig {
        WorkerEndpointConfig {
            id: WorkerId::new(1),
            host_id_override: None,
            trace_at_launch: false,
        }
    }

    #[tokio::test]
    async fn toggle_request_reaches_the_agent_and_succeeds() {
        let h = harness(default_config());
        let reply = h.supervisor.request_tracing(true).await.unwrap();
        assert_eq!(reply, TracingReply::ok());
        assert_eq!(*h.agent.toggles.lock().await, vec![true]);
    }

    #[tokio::test]
    async fn refused_toggle_reports_the_agent_error() {
        let h = harness(default_config());
        h.agent.refuse.store(true, Ordering::SeqCst);
        let reply = h.supervisor.request_tracing(true).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some("tracing requires a license"));
    }

    #[tokio::test]
    async fn trace_at_launch_enables_capture_without_a_request() {
        let config = WorkerEndpointConfig {
            trace_at_launch: true,
            ..default_config()
        };
        let h = harness(config);
        // The launch toggle runs before the loop starts consuming events;
        // a subsequent request observes it already applied.
        let reply = h.supervisor.request_tracing(false).await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(*h.agent.toggles.lock().await, vec![true, false]);
    }

    #[tokio::test]
    async fn sent_traces_arrive_enveloped() {
        let mut h = harness(WorkerEndpointConfig {
            host_id_override: Some("1234".to_string()),
            ..default_config()
        });
        h.sender
            .send_trace(json!({"event": "request", "ms": 12}))
            .await
            .unwrap();

        match h.supervisor_events.recv().await.unwrap() {
            Inbound::Trace { record } => {
                let record = TraceRecord::decode(&record).unwrap();
                assert!(!record.version.is_empty());
                assert_eq!(record.packet.metadata["event"], "request");
                assert_eq!(record.packet.monitoring.system_info.hostname, "1234");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_events_are_dropped_not_sent() {
        let mut h = harness(default_config());
        let result = h.sender.send_trace(json!(42)).await;
        assert!(matches!(result, Err(WorkerError::Encoding(_))));

        // Nothing went on the wire; a status sent afterwards is the first
        // thing the supervisor sees.
        h.sender.send_status(false).await.unwrap();
        assert!(matches!(
            h.supervisor_events.recv().await.unwrap(),
            Inbound::Status { .. }
        ));
    }

    #[tokio::test]
    async fn status_heartbeat_carries_the_worker_id() {
        let mut h = harness(default_config());
        h.sender.send_status(true).await.unwrap();
        match h.supervisor_events.recv().await.unwrap() {
            Inbound::Status { id, is_tracing } => {
                assert_eq!(id, WorkerId::new(1));
                assert!(is_tracing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
