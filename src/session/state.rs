//! Connection state machine types and health snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a `ConnectionSession`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted; only `disconnect()` leaves this state
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }

    /// Whether `connect()` may start from this state
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Reconnecting
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time connection metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub error_count: u64,
    /// Seconds since the current connection was established (0 when down)
    pub uptime_seconds: f64,
    pub connection_started_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

impl ConnectionHealth {
    pub(crate) fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            last_heartbeat_at: None,
            latency_ms: None,
            error_count: 0,
            uptime_seconds: 0.0,
            connection_started_at: None,
            reconnect_attempts: 0,
            max_reconnect_attempts,
        }
    }

    /// Whether the reconnect budget is spent
    pub fn reconnect_exhausted(&self) -> bool {
        self.reconnect_attempts >= self.max_reconnect_attempts
    }
}

/// Status descriptor returned by `connect()` and `status()`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub endpoint: String,
    pub subject: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub health: ConnectionHealth,
}

/// Backoff before reconnect attempt number `attempt` (1-based): `min(2^attempt, cap)`
pub fn reconnect_backoff(attempt: u32, max_backoff_secs: u64) -> Duration {
    let secs = 2u64
        .checked_pow(attempt)
        .unwrap_or(u64::MAX)
        .min(max_backoff_secs);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u64> = (1..=6).map(|a| reconnect_backoff(a, 60).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60]);
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(reconnect_backoff(64, 60), Duration::from_secs(60));
        assert_eq!(reconnect_backoff(200, 60), Duration::from_secs(60));
    }

    #[test]
    fn test_can_connect() {
        assert!(ConnectionState::Disconnected.can_connect());
        assert!(ConnectionState::Reconnecting.can_connect());
        assert!(!ConnectionState::Connected.can_connect());
        assert!(!ConnectionState::Connecting.can_connect());
        assert!(!ConnectionState::Failed.can_connect());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&ConnectionState::Reconnecting).unwrap();
        assert_eq!(json, "\"reconnecting\"");
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_health_exhaustion() {
        let mut health = ConnectionHealth::new(3);
        assert!(!health.reconnect_exhausted());
        health.reconnect_attempts = 3;
        assert!(health.reconnect_exhausted());
    }
}
