//! Error types for langflow-connect

use thiserror::Error;

/// Errors that can occur in the connection, coordination, and health layers
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Invalid connection or component parameters (fatal, never retried)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Token issuance failed or the platform rejected the presented token
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Send, receive, or handshake failure on the socket
    #[error("Network error: {0}")]
    Network(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The session is not in the `Connected` state
    #[error("Not connected (state: {state})")]
    NotConnected { state: String },

    /// Reconnect attempts are exhausted; a manual disconnect + connect is required
    #[error("Reconnect attempts exhausted ({attempts}/{max})")]
    ReconnectExhausted { attempts: u32, max: u32 },

    /// A participant with this name is already registered
    #[error("Participant already registered: {0}")]
    DuplicateParticipant(String),

    /// No participant with this name is registered
    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    /// A participant handler failed while processing a message
    #[error("Handler for participant '{participant}' failed: {reason}")]
    Handler { participant: String, reason: String },

    /// A health probe failed or timed out
    #[error("Probe for check '{check}' failed: {reason}")]
    Probe { check: String, reason: String },

    /// Health check, alert, or resolver not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The component was shut down
    #[error("Closed: {0}")]
    Closed(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConnectError {
    /// Whether the owning loop should retry on its normal cadence
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectError::Network(_) | ConnectError::Timeout(_) | ConnectError::Authentication(_)
        )
    }
}

/// Result type alias for langflow-connect operations
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ConnectError::Network("reset".into()).is_transient());
        assert!(ConnectError::Timeout("handshake".into()).is_transient());
        assert!(ConnectError::Authentication("401".into()).is_transient());
        assert!(!ConnectError::Configuration("no secret".into()).is_transient());
        assert!(!ConnectError::ReconnectExhausted { attempts: 3, max: 3 }.is_transient());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("static text")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static text");

        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }

    #[test]
    fn test_display_messages() {
        let err = ConnectError::ReconnectExhausted { attempts: 5, max: 5 };
        assert_eq!(err.to_string(), "Reconnect attempts exhausted (5/5)");

        let err = ConnectError::Handler {
            participant: "cost-tracker".into(),
            reason: "boom".into(),
        };
        assert!(err.to_string().contains("cost-tracker"));
    }
}
