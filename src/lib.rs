//! # langflow-connect
//!
//! Authenticated connectivity and in-process coordination for hosts that talk
//! to a remote Langflow platform.
//!
//! ## Overview
//!
//! `langflow-connect` keeps one authenticated WebSocket session alive against
//! the platform, routes typed messages between the host's own subsystems, and
//! watches the health of both with scheduled probes and rate-limited alerts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use langflow_connect::{
//!     handler_fn, BusConfig, ConnectionConfig, ConnectionSession, CoordinationBus, MessageType,
//! };
//!
//! # async fn example() -> langflow_connect::Result<()> {
//! // Connect to the platform
//! let session = ConnectionSession::websocket(ConnectionConfig::new(
//!     "wss://flow.example.com/ws",
//!     "shared-secret",
//! ));
//! session.connect().await?;
//! session.send(serde_json::json!({"event": "host.started"})).await?;
//!
//! // Route messages between local subsystems
//! let bus = CoordinationBus::new(BusConfig::default());
//! bus.register_participant("scheduler", handler_fn(|_env| async move { Ok(None) })).await?;
//! bus.register_participant("uplink", handler_fn(|env| async move { Ok(Some(env.payload)) })).await?;
//! bus.start().await?;
//! bus.send("scheduler", "uplink", MessageType::Event, serde_json::json!({"tick": 1})).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! - **ConnectionSession**: token minting, handshake, heartbeat, reconnect with backoff
//! - **CoordinationBus**: named participants exchanging envelopes through one FIFO queue
//! - **HealthSupervisor**: HTTP, WebSocket, ping, and custom probes feeding alert rules
//!
//! ## Transports
//!
//! - **websocket**: tokio-tungstenite client, bearer token in the upgrade request
//! - **memory**: in-process loopback with scriptable failures for tests

pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod monitor;
pub mod session;
pub mod transport;
pub mod wire;

// Re-export core types
pub use auth::{generate_auth_token, verify_token, AuthToken, TokenClaims};
pub use bus::{
    handler_fn, BusStats, CoordinationBus, DeadLetter, DeadLetterHandler, DeadLetterReason,
    Envelope, MemoryDeadLetters, MessageHandler, MessageType, Participant, ParticipantStatus,
};
pub use config::{BusConfig, ConnectionConfig, SupervisorConfig};
pub use error::{ConnectError, Result};
pub use monitor::{
    probe_fn, Alert, AlertCondition, AlertRule, CheckSet, CheckStatus, CheckStore, FileCheckStore,
    HealthCheck, HealthCheckResult, HealthSummary, HealthSupervisor, MemoryCheckStore,
    MonitorType, ProbeOutcome, Prober, Severity,
};
pub use session::{
    reconnect_backoff, ConnectionHealth, ConnectionSession, ConnectionState, ConnectionStatus,
};
pub use wire::WireMessage;

// Re-export transports for convenience
pub use transport::memory::MemoryConnector;
pub use transport::websocket::WebSocketConnector;
pub use transport::{Connector, Link};
