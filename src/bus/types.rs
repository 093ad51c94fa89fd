//! Envelope and participant types for the coordination bus
//!
//! All types use camelCase JSON serialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of an envelope routed through the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Response,
    Event,
    Status,
    Error,
}

/// An addressed, typed unit routed between participants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique envelope identifier (msg-<uuid>)
    pub id: String,

    /// Sending participant
    pub source: String,

    /// Receiving participant
    pub target: String,

    pub message_type: MessageType,

    /// Message payload, arbitrary JSON
    pub payload: serde_json::Value,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    /// Carried for callers; the queue drains in arrival order regardless
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub requires_response: bool,

    /// Id of the envelope this one answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Create a new envelope with auto-generated id and timestamp
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            source: source.into(),
            target: target.into(),
            message_type,
            payload,
            timestamp: now_millis(),
            priority: 0,
            requires_response: false,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Ask the target to answer with a correlated Response
    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    /// Build the Response to this envelope, addressed back to its source
    pub fn response(&self, payload: serde_json::Value) -> Self {
        let mut reply = Self::new(
            self.target.clone(),
            self.source.clone(),
            MessageType::Response,
            payload,
        );
        reply.priority = self.priority;
        reply.correlation_id = Some(self.id.clone());
        reply
    }
}

/// Lifecycle status of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Initializing,
    Running,
    Warning,
    Error,
}

/// Snapshot of a registered participant
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub name: String,
    pub status: ParticipantStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Liveness score, always within [0, 100]
    pub health_score: u8,
    pub message_count: u64,
    pub error_count: u64,
    pub registered_at: DateTime<Utc>,
}

/// Bus traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub responses: u64,
}

/// Get current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_creation() {
        let env = Envelope::new("a", "b", MessageType::Command, serde_json::json!({"k": 1}));
        assert!(env.id.starts_with("msg-"));
        assert_eq!(env.priority, 0);
        assert!(!env.requires_response);
        assert!(env.correlation_id.is_none());
        assert!(env.timestamp > 0);
    }

    #[test]
    fn test_response_addressing() {
        let env = Envelope::new("a", "b", MessageType::Command, serde_json::json!({}))
            .with_priority(3)
            .expecting_response();
        let reply = env.response(serde_json::json!({"ok": true}));

        assert_eq!(reply.source, "b");
        assert_eq!(reply.target, "a");
        assert_eq!(reply.message_type, MessageType::Response);
        assert_eq!(reply.correlation_id.as_deref(), Some(env.id.as_str()));
        assert_eq!(reply.priority, 3);
        assert!(!reply.requires_response);
        assert_ne!(reply.id, env.id);
    }

    #[test]
    fn test_envelope_serialization() {
        let env = Envelope::new("a", "b", MessageType::Event, serde_json::json!(null));
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"messageType\":\"event\""));
        assert!(json.contains("\"requiresResponse\":false"));
        assert!(!json.contains("correlationId"));

        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, env.id);
    }
}
