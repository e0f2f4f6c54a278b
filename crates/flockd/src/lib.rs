//! Control plane for a traced worker fleet.
//!
//! A supervisor process holds one framed JSON control channel per worker and
//! one upstream channel to an external controller. Workers push versioned
//! trace records and liveness statuses up; tracing toggles flow down, each
//! answered by a token-correlated result. The supervisor validates every
//! trace record before forwarding it and broadcasts registry truth upstream
//! on a fixed interval.
//!
//! Process spawning is out of scope: the embedding layer forks workers and
//! hands their pipes to [`Supervisor::attach_worker`] on the supervisor side
//! and [`spawn_worker_endpoint`] on the worker side.

pub mod bridge;
mod config;
mod controller;
mod registry;
mod reporter;
mod supervisor;
mod trace;
pub mod worker;

pub use bridge::channel::{ChannelError, ControlChannel, Inbound};
pub use bridge::protocol::{ControlMessage, Token, TracingReply, WorkerId};
pub use config::SupervisorConfig;
pub use controller::{ControlError, TracingController};
pub use registry::{RegistryError, WorkerRegistry, WorkerStatus};
pub use reporter::StatusReporter;
pub use supervisor::Supervisor;
pub use trace::{
    RecordEncodingError, TRACE_RECORD_VERSION, TraceRecord, TraceRecordEncoder,
};
pub use worker::{
    AgentError, TraceAgent, WorkerEndpointConfig, WorkerError, WorkerSender,
    spawn_worker_endpoint,
};
