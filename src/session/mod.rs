//! Authenticated, self-healing session to the remote platform
//!
//! `ConnectionSession` owns at most one live `Link`. `connect()` mints a
//! fresh token, performs the handshake, and starts the heartbeat task. The
//! heartbeat task is the only automatic reconnect trigger: once the error
//! count passes the configured ceiling it walks the reconnect path with
//! exponential backoff until the link is back or the attempt budget is
//! spent, at which point the session parks in `Failed`.

mod state;

pub use state::{reconnect_backoff, ConnectionHealth, ConnectionState, ConnectionStatus};

use crate::auth::{self, AuthToken};
use crate::config::ConnectionConfig;
use crate::error::{ConnectError, Result};
use crate::transport::websocket::WebSocketConnector;
use crate::transport::{Connector, Link};
use crate::wire::WireMessage;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// A single authenticated channel to the remote platform
pub struct ConnectionSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ConnectionConfig,
    connector: Box<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    health: RwLock<ConnectionHealth>,
    link: RwLock<Option<Arc<dyn Link>>>,
    token: RwLock<Option<AuthToken>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,

    /// Serializes the establish/teardown critical sections
    transition: Mutex<()>,

    /// Bumped by every `disconnect()`; a reconnect that observes a change
    /// once it holds `transition` abandons the attempt
    epoch: AtomicU64,

    reconnects_in_flight: AtomicUsize,
}

impl ConnectionSession {
    /// Create a session over the given connector
    pub fn new(config: ConnectionConfig, connector: impl Connector + 'static) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let health = ConnectionHealth::new(config.max_reconnect_attempts);
        Self {
            inner: Arc::new(SessionInner {
                config,
                connector: Box::new(connector),
                state,
                health: RwLock::new(health),
                link: RwLock::new(None),
                token: RwLock::new(None),
                heartbeat: Mutex::new(None),
                transition: Mutex::new(()),
                epoch: AtomicU64::new(0),
                reconnects_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a session that speaks WebSocket to `config.endpoint`
    pub fn websocket(config: ConnectionConfig) -> Self {
        Self::new(config, WebSocketConnector::new())
    }

    /// Establish the link and start the heartbeat task
    ///
    /// Fails synchronously with `ConnectError::Configuration` on an insecure
    /// endpoint or empty secret. A failed handshake leaves
    /// `reconnect_attempts` untouched.
    pub async fn connect(&self) -> Result<ConnectionStatus> {
        self.inner.connect().await
    }

    /// Reconnect with backoff, consuming one attempt from the shared budget
    pub async fn reconnect(&self) -> Result<ConnectionStatus> {
        self.inner.reconnect().await
    }

    /// Close the link, stop the heartbeat task, and forget the token
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// Send a caller payload wrapped as a `module_data` frame
    ///
    /// Never reconnects; a socket error only bumps `error_count`.
    pub async fn send(&self, payload: serde_json::Value) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ConnectError::NotConnected {
                state: state.to_string(),
            });
        }
        let link = self.inner.link.read().await.clone();
        let Some(link) = link else {
            return Err(ConnectError::NotConnected {
                state: state.to_string(),
            });
        };

        let frame = WireMessage::module_data(payload).to_json()?;
        let size = frame.len();
        if let Err(e) = link.send_text(frame).await {
            let errors = {
                let mut health = self.inner.health.write().await;
                health.error_count += 1;
                health.error_count
            };
            tracing::warn!(error = %e, error_count = errors, "Send failed");
            return Err(e);
        }

        tracing::debug!(bytes = size, "Frame sent");
        Ok(())
    }

    /// Take the next pending data frame without waiting
    ///
    /// Heartbeat frames from the platform refresh `last_heartbeat_at` and are
    /// not returned. Malformed frames are logged and skipped.
    pub async fn receive(&self) -> Option<WireMessage> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        let link = self.inner.link.read().await.clone()?;

        loop {
            let text = link.try_recv()?;
            match WireMessage::from_json(&text) {
                Ok(msg) if msg.is_heartbeat() => {
                    self.inner.health.write().await.last_heartbeat_at = Some(Utc::now());
                }
                Ok(msg) => return Some(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed frame");
                }
            }
        }
    }

    /// Mint a token from the session config without connecting
    pub fn generate_auth_token(&self) -> Result<AuthToken> {
        auth::generate_auth_token(&self.inner.config)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe every state transition
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Snapshot copy of the connection metrics
    pub async fn get_health(&self) -> ConnectionHealth {
        self.inner.health_snapshot().await
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.status().await
    }

    /// Token presented on the current connection, if any
    pub async fn current_token(&self) -> Option<AuthToken> {
        self.inner.token.read().await.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Connector name (e.g., "websocket", "memory")
    pub fn connector_name(&self) -> &str {
        self.inner.connector.name()
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.inner.heartbeat.try_lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionInner {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!(from = %prev, to = %next, endpoint = %self.config.endpoint, "Connection state changed");
        }
    }

    fn exhausted(health: &ConnectionHealth) -> ConnectError {
        ConnectError::ReconnectExhausted {
            attempts: health.reconnect_attempts,
            max: health.max_reconnect_attempts,
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<ConnectionStatus> {
        self.connect_from(None).await
    }

    /// Connect under `transition`; with `epoch` set this is a reconnect
    /// that replaces the current link unless a disconnect got there first
    async fn connect_from(self: &Arc<Self>, epoch: Option<u64>) -> Result<ConnectionStatus> {
        self.config.validate()?;

        let _guard = self.transition.lock().await;
        if let Some(epoch) = epoch {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Err(ConnectError::Closed(
                    "session disconnected during reconnect".to_string(),
                ));
            }
            self.teardown_link().await;
        }

        let prior = self.current_state();
        match prior {
            ConnectionState::Connected | ConnectionState::Connecting => {
                drop(_guard);
                return Ok(self.status().await);
            }
            ConnectionState::Failed => {
                return Err(Self::exhausted(&*self.health.read().await));
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
        }

        if let Err(e) = self.establish().await {
            self.set_state(prior);
            tracing::warn!(endpoint = %self.config.endpoint, error = %e, "Connect failed");
            return Err(e);
        }

        self.ensure_heartbeat().await;
        Ok(self.status().await)
    }

    /// Token, handshake, and link swap; caller holds `transition`
    async fn establish(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);

        let token = auth::generate_auth_token(&self.config)?;
        let link = self
            .connector
            .open(&self.config.endpoint, &token.token, self.config.connect_timeout())
            .await?;
        let link: Arc<dyn Link> = Arc::from(link);

        let previous = self.link.write().await.replace(link);
        if let Some(previous) = previous {
            previous.close().await;
        }
        *self.token.write().await = Some(token);

        {
            let mut health = self.health.write().await;
            health.reconnect_attempts = 0;
            health.error_count = 0;
            health.connection_started_at = Some(Utc::now());
            health.last_heartbeat_at = None;
            health.latency_ms = None;
        }

        self.set_state(ConnectionState::Connected);
        tracing::info!(
            endpoint = %self.config.endpoint,
            connector = self.connector.name(),
            subject = %self.config.subject,
            "Connected"
        );
        Ok(())
    }

    async fn ensure_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock().await;
        let running = slot.as_ref().is_some_and(|h| !h.is_finished());
        if !running {
            let inner = Arc::clone(self);
            *slot = Some(tokio::spawn(inner.heartbeat_loop()));
        }
    }

    async fn reconnect(self: &Arc<Self>) -> Result<ConnectionStatus> {
        let epoch = self.epoch.load(Ordering::SeqCst);

        let attempt = {
            let mut health = self.health.write().await;
            if health.reconnect_exhausted() {
                return Err(Self::exhausted(&health));
            }
            health.reconnect_attempts += 1;
            health.reconnect_attempts
        };
        let _flight = InFlight::enter(&self.reconnects_in_flight);

        self.set_state(ConnectionState::Reconnecting);
        let delay = reconnect_backoff(attempt, self.config.max_backoff_secs);
        tracing::info!(
            attempt,
            max = self.config.max_reconnect_attempts,
            delay_secs = delay.as_secs(),
            "Reconnecting after backoff"
        );
        tokio::time::sleep(delay).await;

        match self.connect_from(Some(epoch)).await {
            Ok(status) => Ok(status),
            Err(e) => {
                let _guard = self.transition.lock().await;
                let health = self.health.read().await.clone();
                if health.reconnect_exhausted()
                    && self.epoch.load(Ordering::SeqCst) == epoch
                    && self.current_state() == ConnectionState::Reconnecting
                {
                    self.set_state(ConnectionState::Failed);
                    tracing::error!(
                        attempts = health.reconnect_attempts,
                        endpoint = %self.config.endpoint,
                        error = %e,
                        "Reconnect attempts exhausted"
                    );
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _guard = self.transition.lock().await;

        let handle = self.heartbeat.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.teardown_link().await;
        *self.token.write().await = None;
        self.health.write().await.connection_started_at = None;

        if self.current_state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn teardown_link(&self) {
        let link = self.link.write().await.take();
        if let Some(link) = link {
            link.close().await;
            tracing::debug!(endpoint = %self.config.endpoint, "Link closed");
        }
    }

    /// Boxed so the spawn in `ensure_heartbeat` does not close a type cycle
    /// through `recover` -> `connect`
    fn heartbeat_loop(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move { self.run_heartbeat().await }.boxed()
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let period = self.config.keepalive_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match self.current_state() {
                ConnectionState::Connected => {}
                ConnectionState::Connecting => continue,
                ConnectionState::Reconnecting => {
                    if self.reconnects_in_flight.load(Ordering::SeqCst) == 0 {
                        self.recover().await;
                    }
                    continue;
                }
                ConnectionState::Disconnected | ConnectionState::Failed => break,
            }

            self.heartbeat_tick().await;

            let errors = self.health.read().await.error_count;
            if errors > self.config.error_ceiling {
                tracing::warn!(
                    error_count = errors,
                    ceiling = self.config.error_ceiling,
                    "Heartbeat failures exceeded ceiling, reconnecting"
                );
                self.recover().await;
            }
        }

        tracing::debug!(state = %self.current_state(), "Heartbeat loop stopped");
    }

    /// Walk the reconnect path until connected, exhausted, or disconnected
    async fn recover(self: &Arc<Self>) {
        loop {
            match self.reconnect().await {
                Ok(_) => return,
                Err(ConnectError::ReconnectExhausted { .. })
                | Err(ConnectError::Closed(_))
                | Err(ConnectError::Configuration(_)) => return,
                Err(e) => {
                    if self.current_state() == ConnectionState::Failed {
                        return;
                    }
                    tracing::warn!(error = %e, "Reconnect attempt failed");
                }
            }
        }
    }

    async fn heartbeat_tick(&self) {
        let link = self.link.read().await.clone();
        let Some(link) = link else {
            return;
        };

        let frame = WireMessage::heartbeat(serde_json::json!({ "subject": self.config.subject }));
        let result = async {
            link.send_text(frame.to_json()?).await?;
            link.ping(self.config.heartbeat_timeout()).await
        }
        .await;

        let mut health = self.health.write().await;
        match result {
            Ok(latency) => {
                health.last_heartbeat_at = Some(Utc::now());
                health.latency_ms = Some(latency.as_micros() as f64 / 1000.0);
                tracing::debug!(latency_ms = health.latency_ms, "Heartbeat ok");
            }
            Err(e) => {
                health.error_count += 1;
                tracing::warn!(error = %e, error_count = health.error_count, "Heartbeat failed");
            }
        }
    }

    async fn health_snapshot(&self) -> ConnectionHealth {
        let mut health = self.health.read().await.clone();
        health.uptime_seconds = match (self.current_state(), health.connection_started_at) {
            (ConnectionState::Connected, Some(started)) => {
                (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        };
        health
    }

    async fn status(&self) -> ConnectionStatus {
        let token_expires_at = self.token.read().await.as_ref().map(|t| t.expires_at);
        ConnectionStatus {
            state: self.current_state(),
            endpoint: self.config.endpoint.clone(),
            subject: self.config.subject.clone(),
            token_expires_at,
            health: self.health_snapshot().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryConnector;

    fn config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("wss://flow.test/ws", "secret");
        config.max_reconnect_attempts = 3;
        config.keepalive_interval_secs = 1;
        config
    }

    fn session() -> (ConnectionSession, MemoryConnector) {
        let connector = MemoryConnector::new();
        (ConnectionSession::new(config(), connector.clone()), connector)
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (session, connector) = session();
        let status = session.connect().await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.token_expires_at.is_some());
        assert_eq!(connector.open_count(), 1);
        assert!(session.current_token().await.is_some());

        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.current_token().await.is_none());

        // idempotent
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_config() {
        let connector = MemoryConnector::new();
        let session =
            ConnectionSession::new(ConnectionConfig::new("ws://flow.test/ws", "s"), connector.clone());
        assert!(matches!(
            session.connect().await,
            Err(ConnectError::Configuration(_))
        ));
        assert_eq!(connector.open_count(), 0);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_keeps_attempts() {
        let (session, connector) = session();
        connector.fail_next_opens(1);
        assert!(session.connect().await.is_err());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.get_health().await.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_presents_fresh_token_each_attempt() {
        let (session, connector) = session();
        session.connect().await.unwrap();
        let first = connector.last_token().unwrap();
        session.disconnect().await;
        session.connect().await.unwrap();
        let second = connector.last_token().unwrap();
        assert_ne!(first, second);
        assert_eq!(first.split('.').count(), 3);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_when_disconnected() {
        let (session, connector) = session();
        let result = session.send(serde_json::json!({"x": 1})).await;
        assert!(matches!(result, Err(ConnectError::NotConnected { .. })));
        assert!(connector.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_send_wraps_module_data() {
        let (session, connector) = session();
        session.connect().await.unwrap();
        session.send(serde_json::json!({"tool": "grep"})).await.unwrap();

        let frames = connector.sent_frames();
        let frame = WireMessage::from_json(frames.last().unwrap()).unwrap();
        assert_eq!(frame.kind, "module_data");
        assert_eq!(frame.data["tool"], "grep");
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_failure_counts_error_without_reconnect() {
        let (session, connector) = session();
        session.connect().await.unwrap();
        connector.set_fail_sends(true);

        assert!(session.send(serde_json::json!({})).await.is_err());
        let health = session.get_health().await;
        assert_eq!(health.error_count, 1);
        assert_eq!(health.reconnect_attempts, 0);
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(connector.open_count(), 1);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_receive_skips_heartbeats_and_garbage() {
        let (session, connector) = session();
        assert!(session.receive().await.is_none());

        session.connect().await.unwrap();
        assert!(session.receive().await.is_none());

        connector.inject(WireMessage::heartbeat(serde_json::Value::Null).to_json().unwrap());
        connector.inject("{{not json");
        connector.inject(
            WireMessage::new("flow_result", serde_json::json!({"ok": true}))
                .to_json()
                .unwrap(),
        );

        let msg = session.receive().await.unwrap();
        assert_eq!(msg.kind, "flow_result");
        assert!(session.receive().await.is_none());
        assert!(session.get_health().await.last_heartbeat_at.is_some());
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_get_health_is_snapshot() {
        let (session, _connector) = session();
        session.connect().await.unwrap();
        let mut snapshot = session.get_health().await;
        snapshot.error_count = 99;
        assert_eq!(session.get_health().await.error_count, 0);
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_measures_latency() {
        let (session, connector) = session();
        connector.set_latency(std::time::Duration::from_millis(25));
        session.connect().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;

        let health = session.get_health().await;
        assert!(health.last_heartbeat_at.is_some());
        assert_eq!(health.latency_ms, Some(25.0));
        assert!(connector
            .sent_frames()
            .iter()
            .any(|f| f.contains("\"type\":\"heartbeat\"")));
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_resets_attempts() {
        let (session, connector) = session();
        session.connect().await.unwrap();

        let status = session.reconnect().await.unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.health.reconnect_attempts, 0);
        assert_eq!(connector.open_count(), 2);
        session.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_abandons_reconnect() {
        let (session, connector) = session();
        session.connect().await.unwrap();
        let session = Arc::new(session);

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.reconnect().await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        session.disconnect().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ConnectError::Closed(_))));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_link_swap_wins() {
        let (session, connector) = session();
        session.connect().await.unwrap();
        connector.set_close_delay(std::time::Duration::from_secs(1));
        let session = Arc::new(session);

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.reconnect().await })
        };
        // backoff ends at 2s, the old link takes until 3s to close
        tokio::time::sleep(std::time::Duration::from_millis(2_500)).await;
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        session.disconnect().await;

        let result = pending.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(session.current_token().await.is_none());
        assert_eq!(connector.open_count(), 2);

        // nothing revives the session afterwards
        let frames = connector.sent_frames().len();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(connector.sent_frames().len(), frames);
        assert_eq!(connector.open_count(), 2);
    }
}
