//! Health supervision: scheduled probes and cooldown-limited alerts
//!
//! `HealthSupervisor` owns a set of `HealthCheck`s, each probed by the
//! prober for its monitor type. Every run records exactly one result in a
//! bounded per-check history, then evaluates alert rules against that
//! history. Alerts are rate limited per (rule, check) pair, kept in a
//! bounded log, and published to broadcast subscribers.

pub mod probe;
pub mod store;
pub mod types;

pub use probe::{
    classify_http_status, probe_fn, ConnectionProber, FnProber, HttpProber, PingProber,
    ProbeOutcome, Prober, WebSocketProber,
};
pub use store::{CheckSet, CheckStore, FileCheckStore, MemoryCheckStore};
pub use types::{
    consecutive_failures, Alert, AlertCondition, AlertRule, CheckStatus, HealthCheck,
    HealthCheckResult, HealthSummary, MonitorType, Severity, DEFAULT_ALERT_COOLDOWN_SECS,
    FAILURE_THRESHOLD_RULE_ID,
};

use crate::config::SupervisorConfig;
use crate::error::{panic_message, ConnectError, Result};
use crate::session::ConnectionSession;
use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

/// Resolver name under which an attached session is probed
pub const CONNECTION_RESOLVER: &str = "connection";

const ALERT_CHANNEL_CAPACITY: usize = 256;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone)]
struct CheckEntry {
    check: HealthCheck,
    history: VecDeque<HealthCheckResult>,
    next_due: Instant,
}

struct SupervisorInner {
    config: SupervisorConfig,
    checks: RwLock<HashMap<String, CheckEntry>>,
    rules: RwLock<Vec<AlertRule>>,
    alerts: RwLock<VecDeque<Alert>>,
    cooldowns: StdMutex<HashMap<(String, String), Instant>>,
    http: HttpProber,
    websocket: WebSocketProber,
    ping: PingProber,
    resolvers: RwLock<HashMap<String, Arc<dyn Prober>>>,
    connection: RwLock<Option<Arc<ConnectionSession>>>,
    alert_tx: broadcast::Sender<Alert>,
    store: Option<Box<dyn CheckStore>>,
}

/// Runs health checks and raises alerts
pub struct HealthSupervisor {
    inner: Arc<SupervisorInner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HealthSupervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        Self::assemble(config, CheckSet::default(), None)
    }

    /// Create a supervisor that loads and saves check definitions
    pub async fn with_store(config: SupervisorConfig, store: impl CheckStore + 'static) -> Result<Self> {
        config.validate()?;
        let store: Box<dyn CheckStore> = Box::new(store);
        let saved = store.load().await?;
        tracing::info!(
            checks = saved.checks.len(),
            rules = saved.rules.len(),
            "Loaded saved health checks"
        );
        Self::assemble(config, saved, Some(store))
    }

    fn assemble(
        config: SupervisorConfig,
        saved: CheckSet,
        store: Option<Box<dyn CheckStore>>,
    ) -> Result<Self> {
        config.validate()?;

        let now = Instant::now();
        let checks = saved
            .checks
            .into_iter()
            .map(|check| {
                let entry = CheckEntry {
                    check,
                    history: VecDeque::new(),
                    next_due: now,
                };
                (entry.check.id.clone(), entry)
            })
            .collect::<HashMap<_, _>>();

        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(SupervisorInner {
                config,
                checks: RwLock::new(checks),
                rules: RwLock::new(saved.rules),
                alerts: RwLock::new(VecDeque::new()),
                cooldowns: StdMutex::new(HashMap::new()),
                http: HttpProber::new()?,
                websocket: WebSocketProber,
                ping: PingProber,
                resolvers: RwLock::new(HashMap::new()),
                connection: RwLock::new(None),
                alert_tx,
                store,
            }),
            monitor: Mutex::new(None),
        })
    }

    /// Add a check and return its id; it is due on the next monitoring tick
    pub async fn create_check(&self, check: HealthCheck) -> Result<String> {
        if check.target.trim().is_empty() {
            return Err(ConnectError::Configuration(format!(
                "health check '{}' has an empty target",
                check.name
            )));
        }
        if check.interval_secs == 0 || check.timeout_secs == 0 {
            return Err(ConnectError::Configuration(format!(
                "health check '{}' needs a non-zero interval and timeout",
                check.name
            )));
        }

        let id = check.id.clone();
        let name = check.name.clone();
        let monitor_type = check.monitor_type;
        let target = check.target.clone();
        let entry = CheckEntry {
            check,
            history: VecDeque::new(),
            next_due: Instant::now(),
        };
        self.inner
            .commit(|checks, _| {
                checks.insert(id.clone(), entry);
                Ok(())
            })
            .await?;
        tracing::info!(
            check_id = %id,
            name = %name,
            monitor_type = ?monitor_type,
            target = %target,
            "Health check created"
        );
        Ok(id)
    }

    /// Remove a check together with the alert rules scoped to it
    pub async fn remove_check(&self, id: &str) -> Result<()> {
        let dropped_rules = self
            .inner
            .commit(|checks, rules| {
                if checks.remove(id).is_none() {
                    return Err(ConnectError::NotFound(format!("health check {}", id)));
                }
                let before = rules.len();
                rules.retain(|r| r.check_id.as_deref() != Some(id));
                Ok(before - rules.len())
            })
            .await?;
        self.inner
            .cooldowns()
            .retain(|(_, check_id), _| check_id != id);
        tracing::info!(check_id = %id, dropped_rules, "Health check removed");
        Ok(())
    }

    /// Pause or resume scheduled runs of a check
    pub async fn set_check_active(&self, id: &str, active: bool) -> Result<()> {
        self.inner
            .commit(|checks, _| {
                let entry = checks
                    .get_mut(id)
                    .ok_or_else(|| ConnectError::NotFound(format!("health check {}", id)))?;
                entry.check.active = active;
                if active {
                    entry.next_due = Instant::now();
                }
                Ok(())
            })
            .await?;
        tracing::info!(check_id = %id, active, "Health check toggled");
        Ok(())
    }

    pub async fn check(&self, id: &str) -> Option<HealthCheck> {
        self.inner.checks.read().await.get(id).map(|e| e.check.clone())
    }

    /// All checks, oldest first
    pub async fn checks(&self) -> Vec<HealthCheck> {
        sorted_checks(&*self.inner.checks.read().await)
    }

    /// Add an alert rule; a rule scoped to a check requires that check to exist
    pub async fn add_alert_rule(&self, rule: AlertRule) -> Result<String> {
        let id = rule.id.clone();
        let name = rule.name.clone();
        let severity = rule.severity;
        self.inner
            .commit(|checks, rules| {
                if let Some(check_id) = &rule.check_id {
                    if !checks.contains_key(check_id) {
                        return Err(ConnectError::NotFound(format!("health check {}", check_id)));
                    }
                }
                rules.push(rule);
                Ok(())
            })
            .await?;
        tracing::info!(rule_id = %id, name = %name, severity = ?severity, "Alert rule added");
        Ok(id)
    }

    pub async fn remove_alert_rule(&self, id: &str) -> Result<()> {
        self.inner
            .commit(|_, rules| {
                let before = rules.len();
                rules.retain(|r| r.id != id);
                if rules.len() == before {
                    return Err(ConnectError::NotFound(format!("alert rule {}", id)));
                }
                Ok(())
            })
            .await?;
        self.inner.cooldowns().retain(|(rule_id, _), _| rule_id != id);
        Ok(())
    }

    pub async fn alert_rules(&self) -> Vec<AlertRule> {
        self.inner.rules.read().await.clone()
    }

    /// Register a resolver for `Custom` checks whose target is `name`
    pub async fn register_resolver(&self, name: &str, prober: impl Prober + 'static) {
        self.inner
            .resolvers
            .write()
            .await
            .insert(name.to_string(), Arc::new(prober));
    }

    /// Report on a connection session through the built-in `connection` resolver
    pub async fn attach_connection(&self, session: Arc<ConnectionSession>) {
        self.register_resolver(CONNECTION_RESOLVER, ConnectionProber::new(Arc::clone(&session)))
            .await;
        *self.inner.connection.write().await = Some(session);
        tracing::info!("Connection session attached to health supervisor");
    }

    /// Probe a check now, recording one result and evaluating alerts
    pub async fn run_check(&self, id: &str) -> Result<HealthCheckResult> {
        self.inner.run_check(id).await
    }

    /// Most recent results first
    pub async fn check_results(&self, id: &str, limit: usize) -> Result<Vec<HealthCheckResult>> {
        let checks = self.inner.checks.read().await;
        let entry = checks
            .get(id)
            .ok_or_else(|| ConnectError::NotFound(format!("health check {}", id)))?;
        Ok(entry.history.iter().rev().take(limit).cloned().collect())
    }

    /// Most recent alerts first
    pub async fn alerts(&self, limit: usize) -> Vec<Alert> {
        self.inner
            .alerts
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn unresolved_alerts(&self) -> Vec<Alert> {
        self.inner
            .alerts
            .read()
            .await
            .iter()
            .rev()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Mark an alert resolved; resolving twice keeps the first timestamp
    pub async fn resolve_alert(&self, id: &str) -> Result<Alert> {
        let mut alerts = self.inner.alerts.write().await;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| ConnectError::NotFound(format!("alert {}", id)))?;
        if !alert.resolved {
            alert.resolved = true;
            alert.resolved_at = Some(Utc::now());
            tracing::info!(alert_id = %id, "Alert resolved");
        }
        Ok(alert.clone())
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.inner.alert_tx.subscribe()
    }

    /// Alerts as a stream; lagging consumers see `Err` items for skipped alerts
    pub fn alert_stream(&self) -> BroadcastStream<Alert> {
        BroadcastStream::new(self.inner.alert_tx.subscribe())
    }

    /// Drop alerts past retention and stale cooldown entries
    ///
    /// Returns the number of alerts removed.
    pub async fn cleanup(&self) -> usize {
        self.inner.cleanup().await
    }

    /// Install the default checks and rules, skipping any whose name exists
    ///
    /// Returns how many checks and rules were added.
    pub async fn install_defaults(&self) -> Result<usize> {
        let mut installed = 0;

        let existing: Vec<String> = self.checks().await.into_iter().map(|c| c.name).collect();
        let connection_check = HealthCheck::new(
            "Platform connection",
            MonitorType::Custom,
            CONNECTION_RESOLVER,
        )
        .with_interval(30)
        .with_timeout(5)
        .with_retries(0);
        if !existing.contains(&connection_check.name) {
            self.create_check(connection_check).await?;
            installed += 1;
        }

        let existing: Vec<String> = self.alert_rules().await.into_iter().map(|r| r.name).collect();
        let defaults = [
            AlertRule::new(
                "Slow response",
                AlertCondition::ResponseTimeAbove { millis: 5_000.0 },
                Severity::Warning,
            ),
            AlertRule::new(
                "High failure rate",
                AlertCondition::FailureRateAbove {
                    threshold: 0.5,
                    window: 10,
                },
                Severity::Error,
            ),
        ];
        for rule in defaults {
            if !existing.contains(&rule.name) {
                self.add_alert_rule(rule).await?;
                installed += 1;
            }
        }

        if installed > 0 {
            tracing::info!(installed, "Default health checks installed");
        }
        Ok(installed)
    }

    pub async fn get_health_summary(&self) -> HealthSummary {
        let (total_checks, active_checks, healthy_checks) = {
            let checks = self.inner.checks.read().await;
            let active: Vec<&CheckEntry> = checks.values().filter(|e| e.check.active).collect();
            let healthy = active
                .iter()
                .filter(|e| {
                    e.history
                        .back()
                        .is_some_and(|r| r.status == CheckStatus::Healthy)
                })
                .count();
            (checks.len(), active.len(), healthy)
        };

        let overall_health_ratio = if active_checks == 0 {
            0.0
        } else {
            healthy_checks as f64 / active_checks as f64
        };

        let connection_status = self
            .inner
            .connection
            .read()
            .await
            .as_ref()
            .map(|session| session.state());

        let since = Utc::now() - self.inner.config.recent_alert_window();
        let recent_alert_count = self
            .inner
            .alerts
            .read()
            .await
            .iter()
            .filter(|a| a.timestamp >= since)
            .count();

        HealthSummary {
            total_checks,
            active_checks,
            healthy_checks,
            overall_health_ratio,
            connection_status,
            recent_alert_count,
        }
    }

    /// Spawn the monitoring loop; no-op if already running
    pub async fn start_monitoring(&self) {
        let mut slot = self.monitor.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move { inner.monitor_loop().await }));
        tracing::info!(
            tick_interval_ms = self.inner.config.tick_interval_ms,
            "Health monitoring started"
        );
    }

    /// Cancel the monitoring loop and wait for it to finish
    pub async fn stop_monitoring(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            tracing::info!("Health monitoring stopped");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for HealthSupervisor {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.monitor.try_lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

fn sorted_checks(entries: &HashMap<String, CheckEntry>) -> Vec<HealthCheck> {
    let mut checks: Vec<HealthCheck> = entries.values().map(|e| e.check.clone()).collect();
    checks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    checks
}

impl SupervisorInner {
    fn cooldowns(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Instant>> {
        self.cooldowns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `edit` to the definitions, saving first when a store is set
    ///
    /// The edit runs against a staged copy; live state is replaced only
    /// after the store accepts the result.
    async fn commit<T>(
        &self,
        edit: impl FnOnce(&mut HashMap<String, CheckEntry>, &mut Vec<AlertRule>) -> Result<T>,
    ) -> Result<T> {
        let mut checks = self.checks.write().await;
        let mut rules = self.rules.write().await;
        let Some(store) = &self.store else {
            return edit(&mut *checks, &mut *rules);
        };

        let mut staged_checks = (*checks).clone();
        let mut staged_rules = (*rules).clone();
        let value = edit(&mut staged_checks, &mut staged_rules)?;

        let set = CheckSet::new(sorted_checks(&staged_checks), staged_rules.clone());
        if let Err(e) = store.save(&set).await {
            tracing::warn!(error = %e, "Check definitions not saved; change discarded");
            return Err(e);
        }
        *checks = staged_checks;
        *rules = staged_rules;
        Ok(value)
    }

    async fn run_check(&self, id: &str) -> Result<HealthCheckResult> {
        let check = self
            .checks
            .read()
            .await
            .get(id)
            .map(|e| e.check.clone())
            .ok_or_else(|| ConnectError::NotFound(format!("health check {}", id)))?;

        let attempts = check.retries.saturating_add(1);
        let mut attempt = 1;
        let outcome = loop {
            let outcome = match self.probe_once(&check).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(check_id = %check.id, error = %e, "Probe could not run");
                    ProbeOutcome {
                        status: CheckStatus::Unknown,
                        response_time_ms: 0.0,
                        error: Some(e.to_string()),
                        details: serde_json::Value::Null,
                    }
                }
            };
            if outcome.status != CheckStatus::Critical || attempt >= attempts {
                break outcome;
            }
            tracing::debug!(
                check_id = %check.id,
                attempt,
                attempts,
                error = ?outcome.error,
                "Probe critical, retrying"
            );
            attempt += 1;
        };

        let result = HealthCheckResult {
            check_id: check.id.clone(),
            timestamp: Utc::now(),
            status: outcome.status,
            response_time_ms: outcome.response_time_ms,
            error: outcome.error,
            details: outcome.details,
        };

        let history: Vec<HealthCheckResult> = {
            let mut checks = self.checks.write().await;
            let Some(entry) = checks.get_mut(id) else {
                // removed while probing
                return Ok(result);
            };
            entry.history.push_back(result.clone());
            while entry.history.len() > self.config.history_limit {
                entry.history.pop_front();
            }
            entry.history.iter().cloned().collect()
        };

        match result.status {
            CheckStatus::Healthy => tracing::debug!(
                check_id = %check.id,
                response_time_ms = result.response_time_ms,
                "Health check passed"
            ),
            status => tracing::warn!(
                check_id = %check.id,
                name = %check.name,
                status = ?status,
                attempts = attempt,
                error = ?result.error,
                "Health check degraded"
            ),
        }

        self.evaluate_alerts(&check, &history).await;
        Ok(result)
    }

    async fn probe_once(&self, check: &HealthCheck) -> Result<ProbeOutcome> {
        let timeout = check.timeout();
        let custom;
        let prober: &dyn Prober = match check.monitor_type {
            MonitorType::Http => &self.http,
            MonitorType::WebSocket => &self.websocket,
            MonitorType::Ping => &self.ping,
            MonitorType::Custom => {
                custom = self
                    .resolvers
                    .read()
                    .await
                    .get(&check.target)
                    .cloned()
                    .ok_or_else(|| ConnectError::Probe {
                        check: check.id.clone(),
                        reason: format!("no resolver registered for '{}'", check.target),
                    })?;
                custom.as_ref()
            }
        };

        let started = Instant::now();
        let attempt = AssertUnwindSafe(prober.probe(&check.target, timeout)).catch_unwind();
        let elapsed_ms = || started.elapsed().as_micros() as f64 / 1000.0;
        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(panic)) => {
                let reason = format!("check panicked: {}", panic_message(panic.as_ref()));
                tracing::error!(check_id = %check.id, target = %check.target, reason = %reason, "Health check panicked");
                Ok(ProbeOutcome {
                    status: CheckStatus::Unknown,
                    response_time_ms: elapsed_ms(),
                    error: Some(reason),
                    details: serde_json::Value::Null,
                })
            }
            Err(_) => Ok(ProbeOutcome::critical(
                elapsed_ms(),
                format!("timed out after {:?}", timeout),
            )),
        }
    }

    async fn evaluate_alerts(&self, check: &HealthCheck, history: &[HealthCheckResult]) {
        let streak = consecutive_failures(history);
        if check.failure_threshold > 0 && streak >= check.failure_threshold as usize {
            let message = history
                .last()
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| "no error detail".to_string());
            self.raise(
                FAILURE_THRESHOLD_RULE_ID,
                check,
                Severity::Critical,
                Duration::from_secs(DEFAULT_ALERT_COOLDOWN_SECS),
                format!("{} is failing", check.name),
                format!("{} consecutive failures (threshold {}): {}", streak, check.failure_threshold, message),
            )
            .await;
        }

        let rules: Vec<AlertRule> = self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.applies_to(&check.id))
            .cloned()
            .collect();
        for rule in rules {
            if let Some(breach) = rule.condition.evaluate(history) {
                self.raise(
                    &rule.id,
                    check,
                    rule.severity,
                    rule.cooldown(),
                    format!("{}: {}", rule.name, check.name),
                    breach,
                )
                .await;
            }
        }
    }

    async fn raise(
        &self,
        rule_id: &str,
        check: &HealthCheck,
        severity: Severity,
        cooldown: Duration,
        title: String,
        message: String,
    ) {
        let now = Instant::now();
        {
            let mut cooldowns = self.cooldowns();
            let key = (rule_id.to_string(), check.id.clone());
            if let Some(last) = cooldowns.get(&key) {
                if now.saturating_duration_since(*last) < cooldown {
                    tracing::debug!(rule_id, check_id = %check.id, "Alert suppressed by cooldown");
                    return;
                }
            }
            cooldowns.insert(key, now);
        }

        let alert = Alert::new(rule_id, check.id.clone(), severity, title, message);
        tracing::warn!(
            alert_id = %alert.id,
            rule_id,
            check_id = %check.id,
            severity = ?severity,
            message = %alert.message,
            "Alert raised"
        );

        {
            let mut alerts = self.alerts.write().await;
            alerts.push_back(alert.clone());
            while alerts.len() > self.config.max_alerts {
                alerts.pop_front();
            }
        }

        // no subscribers is fine
        let _ = self.alert_tx.send(alert);
    }

    async fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - self.config.alert_retention();
        let removed = {
            let mut alerts = self.alerts.write().await;
            let before = alerts.len();
            alerts.retain(|a| a.timestamp >= cutoff);
            before - alerts.len()
        };

        let known: Vec<String> = self.checks.read().await.keys().cloned().collect();
        let now = Instant::now();
        let max_cooldown = Duration::from_secs(self.config.alert_retention_secs);
        self.cooldowns().retain(|(_, check_id), last| {
            known.contains(check_id) && now.saturating_duration_since(*last) < max_cooldown
        });

        if removed > 0 {
            tracing::info!(removed, "Expired alerts pruned");
        }
        removed
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_cleanup = Instant::now();

        loop {
            ticker.tick().await;

            let now = Instant::now();
            let due: Vec<String> = {
                let mut checks = self.checks.write().await;
                checks
                    .values_mut()
                    .filter(|e| e.check.active && e.next_due <= now)
                    .map(|e| {
                        e.next_due = now + e.check.interval();
                        e.check.id.clone()
                    })
                    .collect()
            };

            if !due.is_empty() {
                let runs = due.iter().map(|id| self.run_check(id));
                for (id, outcome) in due.iter().zip(futures::future::join_all(runs).await) {
                    if let Err(e) = outcome {
                        tracing::warn!(check_id = %id, error = %e, "Scheduled health check failed");
                    }
                }
            }

            if now.saturating_duration_since(last_cleanup) >= CLEANUP_INTERVAL {
                self.cleanup().await;
                last_cleanup = now;
            }
        }
    }
}
