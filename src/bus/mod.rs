//! In-process coordination bus
//!
//! Participants register a handler under a unique name and exchange typed
//! envelopes. A single processing task drains the queue in arrival order, so
//! delivery between any pair of participants is FIFO. Handler failures are
//! contained: they lower the target's health score and dead-letter the
//! envelope, but never stop the loop. A second task periodically decays or
//! restores each participant's health score based on how long it has been
//! silent.

pub mod dlq;
pub mod handler;
pub mod types;

pub use dlq::{DeadLetter, DeadLetterHandler, DeadLetterReason, MemoryDeadLetters};
pub use handler::{handler_fn, FnHandler, MessageHandler};
pub use types::{BusStats, Envelope, MessageType, Participant, ParticipantStatus};

use crate::config::BusConfig;
use crate::error::{panic_message, ConnectError, Result};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MAX_HEALTH_SCORE: u8 = 100;
const HANDLER_FAILURE_PENALTY: u8 = 10;
const WARNING_PENALTY: u8 = 5;
const ERROR_PENALTY: u8 = 20;

type Waiter = oneshot::Sender<Result<Envelope>>;

struct Registration {
    handler: Arc<dyn MessageHandler>,
    status: ParticipantStatus,
    last_heartbeat: DateTime<Utc>,
    last_seen: Instant,
    health_score: u8,
    message_count: u64,
    error_count: u64,
    registered_at: DateTime<Utc>,
}

impl Registration {
    fn snapshot(&self, name: &str) -> Participant {
        Participant {
            name: name.to_string(),
            status: self.status,
            last_heartbeat: self.last_heartbeat,
            health_score: self.health_score,
            message_count: self.message_count,
            error_count: self.error_count,
            registered_at: self.registered_at,
        }
    }

    fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
        self.last_seen = Instant::now();
    }
}

struct BusInner {
    config: BusConfig,
    participants: RwLock<HashMap<String, Registration>>,
    queue: mpsc::UnboundedSender<Envelope>,
    pending: StdMutex<HashMap<String, Waiter>>,
    dead_letters: Arc<dyn DeadLetterHandler>,
    stats: StdMutex<BusStats>,
}

/// Typed message router between named participants
pub struct CoordinationBus {
    inner: Arc<BusInner>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoordinationBus {
    /// Create a bus with an in-memory dead letter store
    pub fn new(config: BusConfig) -> Self {
        let dead_letters = MemoryDeadLetters::new(config.dead_letter_capacity);
        Self::with_dead_letters(config, dead_letters)
    }

    /// Create a bus that routes dead letters to a custom handler
    pub fn with_dead_letters(config: BusConfig, dead_letters: impl DeadLetterHandler + 'static) -> Self {
        let (queue, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(BusInner {
                config,
                participants: RwLock::new(HashMap::new()),
                queue,
                pending: StdMutex::new(HashMap::new()),
                dead_letters: Arc::new(dead_letters),
                stats: StdMutex::new(BusStats::default()),
            }),
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the processing and health tasks; no-op if already running
    pub async fn start(&self) -> Result<()> {
        self.inner.config.validate()?;

        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let queue_rx = Arc::clone(&self.queue_rx);
        tasks.push(tokio::spawn(async move {
            let mut rx = queue_rx.lock().await;
            while let Some(envelope) = rx.recv().await {
                inner.dispatch(envelope).await;
            }
        }));

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let period = inner.config.health_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                inner.health_pass().await;
            }
        }));

        tracing::info!(
            health_interval_secs = self.inner.config.health_interval_secs,
            "Coordination bus started"
        );
        Ok(())
    }

    /// Cancel both tasks and wait for them to finish
    ///
    /// Queued envelopes stay queued and are processed after the next `start()`.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        if tasks.is_empty() {
            return;
        }
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Coordination bus stopped");
    }

    /// Register a participant under a unique name
    pub async fn register_participant(
        &self,
        name: &str,
        handler: impl MessageHandler + 'static,
    ) -> Result<()> {
        let mut participants = self.inner.participants.write().await;
        if participants.contains_key(name) {
            return Err(ConnectError::DuplicateParticipant(name.to_string()));
        }

        let now = Utc::now();
        participants.insert(
            name.to_string(),
            Registration {
                handler: Arc::new(handler),
                status: ParticipantStatus::Initializing,
                last_heartbeat: now,
                last_seen: Instant::now(),
                health_score: MAX_HEALTH_SCORE,
                message_count: 0,
                error_count: 0,
                registered_at: now,
            },
        );

        tracing::info!(participant = %name, "Participant registered");
        Ok(())
    }

    /// Remove a participant; returns whether it was registered
    pub async fn unregister_participant(&self, name: &str) -> bool {
        let removed = self.inner.participants.write().await.remove(name).is_some();
        if removed {
            tracing::info!(participant = %name, "Participant unregistered");
        }
        removed
    }

    /// Enqueue a message and return its id without waiting for delivery
    pub async fn send(
        &self,
        source: &str,
        target: &str,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> Result<String> {
        self.send_envelope(Envelope::new(source, target, message_type, payload))
            .await
    }

    /// Enqueue a pre-built envelope
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<String> {
        {
            let mut participants = self.inner.participants.write().await;
            if !participants.contains_key(&envelope.target) {
                return Err(ConnectError::UnknownParticipant(envelope.target.clone()));
            }
            let Some(source) = participants.get_mut(&envelope.source) else {
                return Err(ConnectError::UnknownParticipant(envelope.source.clone()));
            };
            source.message_count += 1;
        }

        let id = envelope.id.clone();
        tracing::debug!(
            message_id = %id,
            source = %envelope.source,
            target = %envelope.target,
            message_type = ?envelope.message_type,
            "Envelope enqueued"
        );
        self.inner.enqueue(envelope)?;
        Ok(id)
    }

    /// Send to every registered participant except the source and `excluding`
    ///
    /// A failure for one target is logged and does not abort the rest.
    pub async fn broadcast(
        &self,
        source: &str,
        message_type: MessageType,
        payload: serde_json::Value,
        excluding: &[&str],
    ) -> Result<Vec<String>> {
        let targets: Vec<String> = {
            let participants = self.inner.participants.read().await;
            if !participants.contains_key(source) {
                return Err(ConnectError::UnknownParticipant(source.to_string()));
            }
            let mut names: Vec<String> = participants
                .keys()
                .filter(|name| name.as_str() != source && !excluding.contains(&name.as_str()))
                .cloned()
                .collect();
            names.sort();
            names
        };

        let mut ids = Vec::with_capacity(targets.len());
        for target in targets {
            match self.send(source, &target, message_type, payload.clone()).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    tracing::warn!(source = %source, target = %target, error = %e, "Broadcast send failed");
                }
            }
        }
        Ok(ids)
    }

    /// Send with `requires_response` and wait for the correlated Response payload
    ///
    /// The Response is handed to this caller instead of the source handler.
    /// A failing target handler surfaces as `ConnectError::Handler`.
    pub async fn request(
        &self,
        source: &str,
        target: &str,
        message_type: MessageType,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let envelope = Envelope::new(source, target, message_type, payload).expecting_response();
        let id = envelope.id.clone();

        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id.clone(), tx);

        if let Err(e) = self.send_envelope(envelope).await {
            self.inner.pending().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response.payload),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(ConnectError::Closed("coordination bus dropped the request".to_string())),
            Err(_) => {
                self.inner.pending().remove(&id);
                Err(ConnectError::Timeout(format!(
                    "no response from '{}' to {} within {:?}",
                    target, id, timeout
                )))
            }
        }
    }

    /// Record that a participant is alive
    pub async fn heartbeat(&self, name: &str) -> Result<()> {
        let mut participants = self.inner.participants.write().await;
        let participant = participants
            .get_mut(name)
            .ok_or_else(|| ConnectError::UnknownParticipant(name.to_string()))?;
        participant.touch();
        Ok(())
    }

    /// Snapshot of one participant, or of all participants sorted by name
    pub async fn get_status(&self, name: Option<&str>) -> Result<Vec<Participant>> {
        let participants = self.inner.participants.read().await;
        match name {
            Some(name) => participants
                .get(name)
                .map(|p| vec![p.snapshot(name)])
                .ok_or_else(|| ConnectError::UnknownParticipant(name.to_string())),
            None => {
                let mut all: Vec<Participant> = participants
                    .iter()
                    .map(|(name, p)| p.snapshot(name))
                    .collect();
                all.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(all)
            }
        }
    }

    /// Snapshot of a single participant
    pub async fn participant(&self, name: &str) -> Option<Participant> {
        self.inner
            .participants
            .read()
            .await
            .get(name)
            .map(|p| p.snapshot(name))
    }

    pub async fn participant_count(&self) -> usize {
        self.inner.participants.read().await.len()
    }

    pub fn stats(&self) -> BusStats {
        *self.inner.stats()
    }

    pub fn dead_letters(&self) -> &dyn DeadLetterHandler {
        self.inner.dead_letters.as_ref()
    }

    pub async fn is_running(&self) -> bool {
        !self.tasks.lock().await.is_empty()
    }

    /// Run one health scoring pass immediately
    pub async fn run_health_pass(&self) {
        self.inner.health_pass().await
    }
}

impl Default for CoordinationBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl Drop for CoordinationBus {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl BusInner {
    fn stats(&self) -> std::sync::MutexGuard<'_, BusStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, envelope: Envelope) -> Result<()> {
        self.queue
            .send(envelope)
            .map_err(|_| ConnectError::Closed("coordination bus queue closed".to_string()))?;
        self.stats().enqueued += 1;
        Ok(())
    }

    async fn dead_letter(&self, envelope: Envelope, reason: DeadLetterReason) {
        self.stats().dead_lettered += 1;
        if let Err(e) = self
            .dead_letters
            .handle(DeadLetter::new(envelope, reason))
            .await
        {
            tracing::error!(error = %e, "Failed to record dead letter");
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        if envelope.message_type == MessageType::Response {
            let waiter = envelope
                .correlation_id
                .as_ref()
                .and_then(|id| self.pending().remove(id));
            if let Some(waiter) = waiter {
                self.stats().delivered += 1;
                let _ = waiter.send(Ok(envelope));
                return;
            }
        }

        let handler = self
            .participants
            .read()
            .await
            .get(&envelope.target)
            .map(|p| Arc::clone(&p.handler));
        let Some(handler) = handler else {
            let reason = if envelope.message_type == MessageType::Response {
                DeadLetterReason::OrphanedResponse
            } else {
                DeadLetterReason::UnknownTarget
            };
            self.fail_waiter(&envelope, ConnectError::UnknownParticipant(envelope.target.clone()));
            self.dead_letter(envelope, reason).await;
            return;
        };

        let timeout = self.config.handler_timeout();
        let outcome = tokio::time::timeout(
            timeout,
            AssertUnwindSafe(handler.handle(&envelope)).catch_unwind(),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(Ok(value))) => {
                self.on_handled(&envelope, value).await;
                return;
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(panic)) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            Err(_) => format!("handler timed out after {:?}", timeout),
        };

        self.on_failed(envelope, failure).await;
    }

    async fn on_handled(&self, envelope: &Envelope, value: Option<serde_json::Value>) {
        if let Some(target) = self.participants.write().await.get_mut(&envelope.target) {
            target.status = ParticipantStatus::Running;
            target.touch();
        }
        self.stats().delivered += 1;
        tracing::debug!(
            message_id = %envelope.id,
            participant = %envelope.target,
            "Envelope handled"
        );

        if envelope.requires_response {
            let reply = envelope.response(value.unwrap_or(serde_json::Value::Null));
            if let Some(responder) = self.participants.write().await.get_mut(&envelope.target) {
                responder.message_count += 1;
            }
            self.stats().responses += 1;
            if let Err(e) = self.enqueue(reply) {
                tracing::error!(message_id = %envelope.id, error = %e, "Failed to enqueue response");
            }
        }
    }

    async fn on_failed(&self, envelope: Envelope, reason: String) {
        {
            let mut participants = self.participants.write().await;
            if let Some(target) = participants.get_mut(&envelope.target) {
                target.error_count += 1;
                target.health_score = target.health_score.saturating_sub(HANDLER_FAILURE_PENALTY);
                tracing::warn!(
                    message_id = %envelope.id,
                    participant = %envelope.target,
                    error_count = target.error_count,
                    health_score = target.health_score,
                    reason = %reason,
                    "Handler failed"
                );
            }
        }
        self.stats().failed += 1;

        self.fail_waiter(
            &envelope,
            ConnectError::Handler {
                participant: envelope.target.clone(),
                reason: reason.clone(),
            },
        );
        self.dead_letter(envelope, DeadLetterReason::HandlerFailed(reason))
            .await;
    }

    /// Wake a `request()` caller waiting on an envelope that will never be answered
    fn fail_waiter(&self, envelope: &Envelope, error: ConnectError) {
        if !envelope.requires_response {
            return;
        }
        if let Some(waiter) = self.pending().remove(&envelope.id) {
            let _ = waiter.send(Err(error));
        }
    }

    async fn health_pass(&self) {
        let warning_after = Duration::from_secs(self.config.warning_after_secs);
        let error_after = Duration::from_secs(self.config.error_after_secs);
        let now = Instant::now();

        let mut participants = self.participants.write().await;
        for (name, p) in participants.iter_mut() {
            let silent = now.saturating_duration_since(p.last_seen);
            let previous = p.status;
            if silent > error_after {
                p.status = ParticipantStatus::Error;
                p.health_score = p.health_score.saturating_sub(ERROR_PENALTY);
            } else if silent > warning_after {
                p.status = ParticipantStatus::Warning;
                p.health_score = p.health_score.saturating_sub(WARNING_PENALTY);
            } else {
                p.status = ParticipantStatus::Running;
                p.health_score = p.health_score.saturating_add(1).min(MAX_HEALTH_SCORE);
            }

            if p.status != previous {
                tracing::info!(
                    participant = %name,
                    from = ?previous,
                    to = ?p.status,
                    silent_secs = silent.as_secs(),
                    health_score = p.health_score,
                    "Participant status changed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> impl MessageHandler {
        handler_fn(|_env: Envelope| async move { Ok(None) })
    }

    #[tokio::test]
    async fn test_register_duplicate_keeps_original() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();
        bus.heartbeat("a").await.unwrap();

        let err = bus.register_participant("a", noop()).await.unwrap_err();
        assert!(matches!(err, ConnectError::DuplicateParticipant(ref n) if n == "a"));
        assert_eq!(bus.participant_count().await, 1);

        let p = bus.participant("a").await.unwrap();
        assert_eq!(p.status, ParticipantStatus::Initializing);
        assert_eq!(p.health_score, 100);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();
        assert!(bus.unregister_participant("a").await);
        assert!(!bus.unregister_participant("a").await);
    }

    #[tokio::test]
    async fn test_send_requires_both_participants() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();

        let err = bus
            .send("a", "ghost", MessageType::Command, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::UnknownParticipant(ref n) if n == "ghost"));

        let err = bus
            .send("ghost", "a", MessageType::Command, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::UnknownParticipant(_)));
        assert_eq!(bus.stats().enqueued, 0);
    }

    #[tokio::test]
    async fn test_send_counts_source_messages() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();
        bus.register_participant("b", noop()).await.unwrap();

        let id = bus
            .send("a", "b", MessageType::Event, serde_json::json!(1))
            .await
            .unwrap();
        assert!(id.starts_with("msg-"));
        assert_eq!(bus.participant("a").await.unwrap().message_count, 1);
        assert_eq!(bus.participant("b").await.unwrap().message_count, 0);
        assert_eq!(bus.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn test_handler_error_lowers_score_and_dead_letters() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();
        bus.register_participant(
            "b",
            handler_fn(|_env: Envelope| async move {
                Err(ConnectError::Handler {
                    participant: "b".into(),
                    reason: "bad input".into(),
                })
            }),
        )
        .await
        .unwrap();
        bus.start().await.unwrap();

        bus.send_envelope(
            Envelope::new("a", "b", MessageType::Command, serde_json::json!({})).expecting_response(),
        )
        .await
        .unwrap();

        for _ in 0..100 {
            if bus.stats().failed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let b = bus.participant("b").await.unwrap();
        assert_eq!(b.error_count, 1);
        assert_eq!(b.health_score, 90);
        assert_eq!(bus.stats().responses, 0);
        assert_eq!(bus.dead_letters().count().await.unwrap(), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_loop() {
        let bus = CoordinationBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.register_participant("a", noop()).await.unwrap();
        {
            let seen = Arc::clone(&seen);
            bus.register_participant(
                "b",
                handler_fn(move |env: Envelope| {
                    let seen = Arc::clone(&seen);
                    async move {
                        if env.payload["explode"] == true {
                            panic!("kaboom");
                        }
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(None)
                    }
                }),
            )
            .await
            .unwrap();
        }
        bus.start().await.unwrap();

        bus.send("a", "b", MessageType::Command, serde_json::json!({"explode": true}))
            .await
            .unwrap();
        bus.send("a", "b", MessageType::Command, serde_json::json!({"explode": false}))
            .await
            .unwrap();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let b = bus.participant("b").await.unwrap();
        assert_eq!(b.error_count, 1);
        assert_eq!(b.status, ParticipantStatus::Running);
        bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_timeout_is_failure() {
        let mut config = BusConfig::default();
        config.handler_timeout_secs = 1;
        let bus = CoordinationBus::new(config);
        bus.register_participant("a", noop()).await.unwrap();
        bus.register_participant(
            "slow",
            handler_fn(|_env: Envelope| async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(None)
            }),
        )
        .await
        .unwrap();
        bus.start().await.unwrap();

        let err = bus
            .request("a", "slow", MessageType::Command, serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Handler { .. }));
        assert_eq!(bus.participant("slow").await.unwrap().health_score, 90);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_request_returns_response_payload() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();
        bus.register_participant(
            "b",
            handler_fn(|env: Envelope| async move { Ok(Some(serde_json::json!({ "got": env.payload }))) }),
        )
        .await
        .unwrap();
        bus.start().await.unwrap();

        let value = bus
            .request("a", "b", MessageType::Command, serde_json::json!(5), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!({ "got": 5 }));
        assert_eq!(bus.stats().responses, 1);
        bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_when_stopped() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();
        bus.register_participant("b", noop()).await.unwrap();

        let err = bus
            .request("a", "b", MessageType::Command, serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unregistered_target_is_dead_lettered() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();
        bus.register_participant("b", noop()).await.unwrap();
        bus.send("a", "b", MessageType::Event, serde_json::json!({}))
            .await
            .unwrap();
        bus.unregister_participant("b").await;
        bus.start().await.unwrap();

        for _ in 0..100 {
            if bus.stats().dead_lettered == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let letters = bus.dead_letters().list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::UnknownTarget);
        assert_eq!(bus.dead_letters().list_for_target("b", 10).await.unwrap().len(), 1);
        assert!(bus.dead_letters().list_for_target("a", 10).await.unwrap().is_empty());
        bus.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_pass_thresholds() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();

        bus.run_health_pass().await;
        let a = bus.participant("a").await.unwrap();
        assert_eq!(a.status, ParticipantStatus::Running);
        assert_eq!(a.health_score, 100);

        tokio::time::advance(Duration::from_secs(61)).await;
        bus.run_health_pass().await;
        let a = bus.participant("a").await.unwrap();
        assert_eq!(a.status, ParticipantStatus::Warning);
        assert_eq!(a.health_score, 95);

        tokio::time::advance(Duration::from_secs(240)).await;
        bus.run_health_pass().await;
        let a = bus.participant("a").await.unwrap();
        assert_eq!(a.status, ParticipantStatus::Error);
        assert_eq!(a.health_score, 75);

        bus.heartbeat("a").await.unwrap();
        bus.run_health_pass().await;
        let a = bus.participant("a").await.unwrap();
        assert_eq!(a.status, ParticipantStatus::Running);
        assert_eq!(a.health_score, 76);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_score_floors_at_zero() {
        let bus = CoordinationBus::default();
        bus.register_participant("a", noop()).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        for _ in 0..10 {
            bus.run_health_pass().await;
        }
        assert_eq!(bus.participant("a").await.unwrap().health_score, 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown_are_idempotent() {
        let bus = CoordinationBus::default();
        bus.start().await.unwrap();
        bus.start().await.unwrap();
        assert!(bus.is_running().await);
        bus.shutdown().await;
        bus.shutdown().await;
        assert!(!bus.is_running().await);
    }

    #[tokio::test]
    async fn test_start_rejects_bad_config() {
        let mut config = BusConfig::default();
        config.warning_after_secs = 600;
        let bus = CoordinationBus::new(config);
        assert!(matches!(bus.start().await, Err(ConnectError::Configuration(_))));
    }
}
