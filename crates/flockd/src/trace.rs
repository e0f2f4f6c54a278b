//! Trace record envelope.
//!
//! Workers wrap raw captured events in a versioned envelope before pushing
//! them over the control channel; the supervisor runs every incoming record
//! through [`TraceRecord::decode`] and drops anything malformed instead of
//! forwarding it. A partially-parsed record never escapes this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version stamped into every record.
pub const TRACE_RECORD_VERSION: &str = "1.2.0";

#[derive(Debug, thiserror::Error)]
pub enum RecordEncodingError {
    /// The raw captured event was not a JSON object.
    #[error("raw trace event is not an object")]
    NotAnObject,

    /// The record carries no usable metadata block.
    #[error("trace record metadata missing or null")]
    MissingMetadata,

    /// The record version identifier is absent or empty.
    #[error("trace record version missing or empty")]
    MissingVersion,

    /// The record is not valid JSON or misses structural fields.
    #[error("malformed trace record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Versioned envelope for one captured trace event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub version: String,
    pub packet: TracePacket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracePacket {
    /// Descriptive block taken from the raw event.
    pub metadata: Value,
    pub monitoring: Monitoring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitoring {
    #[serde(rename = "systemInfo")]
    pub system_info: SystemInfo,
    /// When the record was encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TraceRecord {
    /// Parse and validate a wire record.
    ///
    /// `version` and `packet.metadata` are mandatory; their absence is a
    /// framing defect, not a tolerable variation.
    pub fn decode(raw: &str) -> Result<Self, RecordEncodingError> {
        let record: TraceRecord = serde_json::from_str(raw)?;
        if record.version.is_empty() {
            return Err(RecordEncodingError::MissingVersion);
        }
        if record.packet.metadata.is_null() {
            return Err(RecordEncodingError::MissingMetadata);
        }
        Ok(record)
    }

    /// Serialize for the `traceObject` wire message.
    pub fn to_wire(&self) -> Result<String, RecordEncodingError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Wraps raw captured events into the versioned envelope.
///
/// Host identity is resolved once at construction: the configured override
/// wins, otherwise the host's network name.
#[derive(Debug, Clone)]
pub struct TraceRecordEncoder {
    hostname: String,
}

impl TraceRecordEncoder {
    pub fn new(host_id_override: Option<&str>) -> Self {
        let hostname = match host_id_override {
            Some(id) => id.to_string(),
            None => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
        };
        Self { hostname }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Wrap a raw captured event.
    ///
    /// The event must be a JSON object; it becomes the record's metadata
    /// block verbatim. Anything else fails and the event is dropped by the
    /// caller rather than forwarded malformed.
    pub fn encode(&self, raw: Value) -> Result<TraceRecord, RecordEncodingError> {
        if raw.is_null() {
            return Err(RecordEncodingError::MissingMetadata);
        }
        if !raw.is_object() {
            return Err(RecordEncodingError::NotAnObject);
        }
        Ok(TraceRecord {
            version: TRACE_RECORD_VERSION.to_string(),
            packet: TracePacket {
                metadata: raw,
                monitoring: Monitoring {
                    system_info: SystemInfo {
                        hostname: self.hostname.clone(),
                        extra: serde_json::Map::new(),
                    },
                    timestamp: Some(Utc::now()),
                },
            },
        })
    }
}
