//! JSON frames exchanged with the remote platform
//!
//! Every frame is `{"type": ..., "timestamp": <RFC 3339>, "data": ...}`.

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Reserved frame type for keepalive traffic
pub const HEARTBEAT: &str = "heartbeat";

/// Frame type wrapping caller payloads
pub const MODULE_DATA: &str = "module_data";

/// A single frame on the session socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: String,

    /// RFC 3339 UTC timestamp
    pub timestamp: String,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl WireMessage {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        }
    }

    /// Wrap a caller payload for transmission
    pub fn module_data(data: serde_json::Value) -> Self {
        Self::new(MODULE_DATA, data)
    }

    /// Build a keepalive frame
    pub fn heartbeat(data: serde_json::Value) -> Self {
        Self::new(HEARTBEAT, data)
    }

    /// Whether this frame is keepalive traffic rather than data
    pub fn is_heartbeat(&self) -> bool {
        self.kind == HEARTBEAT
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
