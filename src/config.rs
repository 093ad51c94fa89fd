//! Configuration consumed by the session, bus, and supervisor
//!
//! All configuration is supplied as plain structs. Nothing in this crate
//! reads files or environment variables; callers deserialize or build
//! these values themselves.

use crate::error::{ConnectError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Issuer claim placed in every auth token
pub const DEFAULT_ISSUER: &str = "langflow_connect";

/// Audience claim placed in every auth token
pub const DEFAULT_AUDIENCE: &str = "langflow";

/// Connection parameters for a `ConnectionSession`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Remote platform endpoint (must be `wss://` unless `allow_insecure`)
    pub endpoint: String,

    /// Shared HMAC secret used to sign auth tokens
    #[serde(skip_serializing)]
    pub secret: String,

    /// Subject claim identifying this host to the platform
    pub subject: String,

    /// Token issuer claim
    pub issuer: String,

    /// Token audience claim
    pub audience: String,

    /// Token lifetime in seconds
    pub token_ttl_secs: u64,

    /// Handshake timeout in seconds
    pub connect_timeout_secs: u64,

    /// Heartbeat round-trip timeout in seconds
    pub heartbeat_timeout_secs: u64,

    /// Interval between heartbeats in seconds
    pub keepalive_interval_secs: u64,

    /// Reconnect attempts allowed before the session enters `Failed`
    pub max_reconnect_attempts: u32,

    /// Upper bound on reconnect backoff in seconds
    pub max_backoff_secs: u64,

    /// Heartbeat loop triggers a reconnect once `error_count` exceeds this
    pub error_ceiling: u64,

    /// Permit plain `ws://` endpoints (local development only)
    pub allow_insecure: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            secret: String::new(),
            subject: "langflow-connect-host".to_string(),
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            token_ttl_secs: 3600,
            connect_timeout_secs: 10,
            heartbeat_timeout_secs: 10,
            keepalive_interval_secs: 30,
            max_reconnect_attempts: 5,
            max_backoff_secs: 60,
            error_ceiling: 10,
            allow_insecure: false,
        }
    }
}

impl ConnectionConfig {
    /// Create a config for the given endpoint and secret, other fields defaulted
    pub fn new(endpoint: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret: secret.into(),
            ..Default::default()
        }
    }

    /// Check that the endpoint is secure and the secret is present
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_empty() {
            return Err(ConnectError::Configuration(
                "shared secret must not be empty".to_string(),
            ));
        }
        if self.endpoint.is_empty() {
            return Err(ConnectError::Configuration(
                "endpoint URL must not be empty".to_string(),
            ));
        }
        let secure = self.endpoint.starts_with("wss://");
        let insecure_allowed = self.allow_insecure && self.endpoint.starts_with("ws://");
        if !secure && !insecure_allowed {
            return Err(ConnectError::Configuration(format!(
                "endpoint '{}' is not a secure websocket URL (wss://)",
                self.endpoint
            )));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(ConnectError::Configuration(
                "keepalive interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Tuning for the `CoordinationBus`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// How often the participant health loop runs, in seconds
    pub health_interval_secs: u64,

    /// Silence after which a participant is marked `Warning`
    pub warning_after_secs: u64,

    /// Silence after which a participant is marked `Error`
    pub error_after_secs: u64,

    /// Upper bound on a single handler invocation, in seconds
    pub handler_timeout_secs: u64,

    /// Maximum dead letters retained in memory
    pub dead_letter_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            warning_after_secs: 60,
            error_after_secs: 300,
            handler_timeout_secs: 30,
            dead_letter_capacity: 1_000,
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.health_interval_secs == 0 {
            return Err(ConnectError::Configuration(
                "bus health interval must be positive".to_string(),
            ));
        }
        if self.warning_after_secs >= self.error_after_secs {
            return Err(ConnectError::Configuration(format!(
                "warning threshold ({}s) must be below error threshold ({}s)",
                self.warning_after_secs, self.error_after_secs
            )));
        }
        Ok(())
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

/// Upper bound for alert retention and the recent-alert window (ten years)
pub const MAX_ALERT_WINDOW_SECS: u64 = 10 * 365 * 24 * 3600;

fn alert_window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_ALERT_WINDOW_SECS) as i64)
}

/// Tuning for the `HealthSupervisor`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Monitoring loop tick in milliseconds
    pub tick_interval_ms: u64,

    /// Results retained per check
    pub history_limit: usize,

    /// Alerts retained in total
    pub max_alerts: usize,

    /// Resolved and unresolved alerts older than this are pruned, in seconds
    pub alert_retention_secs: u64,

    /// Window used for `recent_alert_count` in the summary, in seconds
    pub recent_alert_window_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            history_limit: 100,
            max_alerts: 1_000,
            alert_retention_secs: 7 * 24 * 3600,
            recent_alert_window_secs: 3600,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(ConnectError::Configuration(
                "monitoring tick must be positive".to_string(),
            ));
        }
        if self.history_limit == 0 {
            return Err(ConnectError::Configuration(
                "history limit must be at least 1".to_string(),
            ));
        }
        for (name, secs) in [
            ("alert retention", self.alert_retention_secs),
            ("recent alert window", self.recent_alert_window_secs),
        ] {
            if secs > MAX_ALERT_WINDOW_SECS {
                return Err(ConnectError::Configuration(format!(
                    "{} of {}s exceeds the {}s limit",
                    name, secs, MAX_ALERT_WINDOW_SECS
                )));
            }
        }
        Ok(())
    }

    /// Alert retention as a calendar offset
    pub fn alert_retention(&self) -> chrono::Duration {
        alert_window(self.alert_retention_secs)
    }

    /// Recent-alert window as a calendar offset
    pub fn recent_alert_window(&self) -> chrono::Duration {
        alert_window(self.recent_alert_window_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.issuer, "langflow_connect");
        assert_eq!(config.audience, "langflow");
        assert_eq!(config.max_backoff_secs, 60);
        assert_eq!(config.error_ceiling, 10);
        assert!(!config.allow_insecure);
    }

    #[test]
    fn test_validate_requires_secret() {
        let config = ConnectionConfig::new("wss://flow.example.com/ws", "");
        assert!(matches!(
            config.validate(),
            Err(ConnectError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_requires_secure_endpoint() {
        let config = ConnectionConfig::new("ws://flow.example.com/ws", "s3cret");
        assert!(config.validate().is_err());

        let config = ConnectionConfig::new("https://flow.example.com", "s3cret");
        assert!(config.validate().is_err());

        let config = ConnectionConfig::new("wss://flow.example.com/ws", "s3cret");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_allow_insecure() {
        let mut config = ConnectionConfig::new("ws://127.0.0.1:9000/ws", "s3cret");
        config.allow_insecure = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_secret_not_serialized() {
        let config = ConnectionConfig::new("wss://flow.example.com/ws", "top-secret");
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("top-secret"));
        assert!(json.contains("\"keepalive_interval_secs\":30"));
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"endpoint": "wss://x/ws", "max_reconnect_attempts": 3}"#)
                .unwrap();
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.keepalive_interval_secs, 30);
        assert!(config.secret.is_empty());
    }

    #[test]
    fn test_bus_config_thresholds() {
        assert!(BusConfig::default().validate().is_ok());
        let config = BusConfig {
            warning_after_secs: 300,
            error_after_secs: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_supervisor_config_validate() {
        assert!(SupervisorConfig::default().validate().is_ok());
        let config = SupervisorConfig {
            history_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_supervisor_config_bounds_alert_windows() {
        let config = SupervisorConfig {
            alert_retention_secs: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConnectError::Configuration(_))
        ));

        let config = SupervisorConfig {
            recent_alert_window_secs: MAX_ALERT_WINDOW_SECS + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // accessors saturate even on an unvalidated config
        let config = SupervisorConfig {
            recent_alert_window_secs: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            config.recent_alert_window(),
            chrono::Duration::seconds(MAX_ALERT_WINDOW_SECS as i64)
        );
    }
}
