//! Supervisor startup configuration.
//!
//! Built once at startup and handed by reference to the components that
//! need it; the core never consults environment state on its own.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of worker processes the external lifecycle layer will attach.
    pub cluster_size: usize,
    /// Start every worker with tracing already enabled.
    pub trace_at_launch: bool,
    /// Replaces the real hostname in trace records when set.
    pub host_id_override: Option<String>,
    /// Interval between status broadcasts.
    pub status_interval: Duration,
    /// Deadline for tracing toggle requests. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl SupervisorConfig {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            cluster_size,
            trace_at_launch: false,
            host_id_override: None,
            status_interval: Duration::from_secs(1),
            request_timeout: Some(Duration::from_secs(10)),
        }
    }

    pub fn with_trace_at_launch(mut self, enabled: bool) -> Self {
        self.trace_at_launch = enabled;
        self
    }

    pub fn with_host_id_override(mut self, id: impl Into<String>) -> Self {
        self.host_id_override = Some(id.into());
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}
