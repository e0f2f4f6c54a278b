//! Wire protocol for the control channel.
//!
//! Every frame carries exactly one [`ControlMessage`], a tagged union keyed
//! by `cmd`. A frame with an unrecognized tag fails deserialization; the
//! channel logs it and drops it without tearing down the connection.

use serde::{Deserialize, Serialize};

/// Identifier of a managed worker process.
///
/// Id 0 is reserved for the supervisor's own pseudo-worker, which never
/// traces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// The supervisor's own entry in the registry.
    pub const SUPERVISOR: WorkerId = WorkerId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn is_supervisor(&self) -> bool {
        self.0 == 0
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation token pairing a request with its eventual response.
///
/// UUID v4 keeps tokens unique across channel restarts, so a stale response
/// can never match a fresh request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(uuid::Uuid);

impl Token {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages exchanged over a control channel, in either direction.
///
/// `Tracing` is a request and is answered by a `TracingResult` carrying the
/// same token. `Status` and `TraceObject` are fire-and-forget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Status broadcast for one worker.
    #[serde(rename_all = "camelCase")]
    Status { id: WorkerId, is_tracing: bool },

    /// Serialized trace record, pushed while tracing is active.
    TraceObject { record: String },

    /// Request to toggle trace capture on the receiving side.
    Tracing { token: Token, enabled: bool },

    /// Answer to a `Tracing` request. `error` is set when the toggle was
    /// refused; state on the requesting side must then stay unchanged.
    TracingResult {
        token: Token,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Resolved outcome of a tracing toggle request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingReply {
    pub error: Option<String>,
}

impl TracingReply {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn refused(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
