//! Health check, result, and alert types
//!
//! All types use camelCase JSON serialization.

use crate::session::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Cooldown applied to rules that do not set one, and to the built-in
/// failure-threshold alert
pub const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 300;

/// Rule id used for alerts raised by a check's own `failure_threshold`
pub const FAILURE_THRESHOLD_RULE_ID: &str = "builtin-failure-threshold";

/// How a check's target is probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorType {
    /// ICMP echo via the system `ping` utility; target is a host
    Ping,
    /// HTTP GET; target is a URL
    Http,
    /// WebSocket handshake; target is a `ws://` or `wss://` URL
    #[serde(rename = "websocket")]
    WebSocket,
    /// Registered resolver; target is the resolver name
    Custom,
}

/// Outcome classification of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl CheckStatus {
    /// Whether the result counts toward failure rate and consecutive failures
    pub fn is_failure(&self) -> bool {
        matches!(self, CheckStatus::Critical | CheckStatus::Unknown)
    }
}

/// A scheduled liveness test against a target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// Unique check identifier (check-<uuid>)
    pub id: String,
    pub name: String,
    pub monitor_type: MonitorType,
    pub target: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Extra attempts made while a probe reports Critical
    pub retries: u32,
    /// Consecutive failures that raise a Critical alert
    pub failure_threshold: u32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, monitor_type: MonitorType, target: impl Into<String>) -> Self {
        Self {
            id: format!("check-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            monitor_type,
            target: target.into(),
            interval_secs: 60,
            timeout_secs: 10,
            retries: 3,
            failure_threshold: 3,
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// One recorded probe outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub check_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: CheckStatus,
    pub response_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Alert severity, ordered `Info < Warning < Error < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// What an alert rule watches for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertCondition {
    /// Latest result slower than `millis`
    ResponseTimeAbove { millis: f64 },
    /// Share of failures among the last `window` results exceeds `threshold`
    FailureRateAbove { threshold: f64, window: usize },
    /// At least `count` failures in a row
    ConsecutiveFailures { count: u32 },
}

impl AlertCondition {
    /// Evaluate against a check's history (oldest first)
    ///
    /// Returns a description of the breach, if any.
    pub fn evaluate(&self, history: &[HealthCheckResult]) -> Option<String> {
        let latest = history.last()?;
        match *self {
            AlertCondition::ResponseTimeAbove { millis } => (latest.response_time_ms > millis)
                .then(|| {
                    format!(
                        "response time {:.1}ms exceeds {:.1}ms",
                        latest.response_time_ms, millis
                    )
                }),
            AlertCondition::FailureRateAbove { threshold, window } => {
                let window = window.max(1);
                let recent = &history[history.len().saturating_sub(window)..];
                let failures = recent.iter().filter(|r| r.status.is_failure()).count();
                let rate = failures as f64 / recent.len() as f64;
                (rate > threshold).then(|| {
                    format!(
                        "failure rate {:.0}% ({}/{}) exceeds {:.0}%",
                        rate * 100.0,
                        failures,
                        recent.len(),
                        threshold * 100.0
                    )
                })
            }
            AlertCondition::ConsecutiveFailures { count } => {
                let streak = consecutive_failures(history);
                (count > 0 && streak >= count as usize)
                    .then(|| format!("{} consecutive failures", streak))
            }
        }
    }
}

/// Number of trailing failed results
pub fn consecutive_failures(history: &[HealthCheckResult]) -> usize {
    history
        .iter()
        .rev()
        .take_while(|r| r.status.is_failure())
        .count()
}

/// A condition that raises alerts, scoped to one check or to all checks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    /// Unique rule identifier (rule-<uuid>)
    pub id: String,
    pub name: String,
    /// Restrict to one check; `None` applies the rule to every check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_id: Option<String>,
    pub condition: AlertCondition,
    pub severity: Severity,
    /// Minimum seconds between alerts for the same (rule, check) pair
    pub cooldown_secs: u64,
    pub enabled: bool,
}

impl AlertRule {
    pub fn new(name: impl Into<String>, condition: AlertCondition, severity: Severity) -> Self {
        Self {
            id: format!("rule-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            check_id: None,
            condition,
            severity,
            cooldown_secs: DEFAULT_ALERT_COOLDOWN_SECS,
            enabled: true,
        }
    }

    pub fn for_check(mut self, check_id: impl Into<String>) -> Self {
        self.check_id = Some(check_id.into());
        self
    }

    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    pub fn applies_to(&self, check_id: &str) -> bool {
        self.enabled && self.check_id.as_deref().map_or(true, |id| id == check_id)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// A raised alert
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Unique alert identifier (alert-<uuid>)
    pub id: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub rule_id: String,
    pub check_id: String,
}

impl Alert {
    pub(crate) fn new(
        rule_id: impl Into<String>,
        check_id: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("alert-{}", uuid::Uuid::new_v4()),
            title: title.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            resolved: false,
            resolved_at: None,
            rule_id: rule_id.into(),
            check_id: check_id.into(),
        }
    }
}

/// Aggregate view over all checks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub total_checks: usize,
    pub active_checks: usize,
    /// Active checks whose latest result is Healthy
    pub healthy_checks: usize,
    /// `healthy_checks / active_checks`, 0 when nothing is active
    pub overall_health_ratio: f64,
    /// State of the attached connection session, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_status: Option<ConnectionState>,
    /// Alerts raised within the recent-alert window
    pub recent_alert_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: CheckStatus, ms: f64) -> HealthCheckResult {
        HealthCheckResult {
            check_id: "c".to_string(),
            timestamp: Utc::now(),
            status,
            response_time_ms: ms,
            error: None,
            details: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn test_failure_rate_window() {
        let history = vec![
            result(CheckStatus::Critical, 1.0),
            result(CheckStatus::Critical, 1.0),
            result(CheckStatus::Healthy, 1.0),
            result(CheckStatus::Healthy, 1.0),
            result(CheckStatus::Critical, 1.0),
        ];
        let cond = AlertCondition::FailureRateAbove { threshold: 0.3, window: 5 };
        assert!(cond.evaluate(&history).is_some());

        // Only the last two results: 1/2 = 0.5
        let cond = AlertCondition::FailureRateAbove { threshold: 0.5, window: 2 };
        assert!(cond.evaluate(&history).is_none());
    }

    #[test]
    fn test_consecutive_failures() {
        let history = vec![
            result(CheckStatus::Critical, 1.0),
            result(CheckStatus::Healthy, 1.0),
            result(CheckStatus::Unknown, 1.0),
            result(CheckStatus::Critical, 1.0),
        ];
        assert_eq!(consecutive_failures(&history), 2);
        assert!(AlertCondition::ConsecutiveFailures { count: 2 }.evaluate(&history).is_some());
        assert!(AlertCondition::ConsecutiveFailures { count: 3 }.evaluate(&history).is_none());
    }

    #[test]
    fn test_response_time_uses_latest() {
        let history = vec![result(CheckStatus::Healthy, 900.0), result(CheckStatus::Healthy, 20.0)];
        let cond = AlertCondition::ResponseTimeAbove { millis: 500.0 };
        assert!(cond.evaluate(&history).is_none());
        assert!(cond.evaluate(&history[..1]).is_some());
        assert!(cond.evaluate(&[]).is_none());
    }

    #[test]
    fn test_warning_is_not_failure() {
        assert!(!CheckStatus::Warning.is_failure());
        assert!(!CheckStatus::Healthy.is_failure());
        assert!(CheckStatus::Critical.is_failure());
    }

    #[test]
    fn test_rule_scope() {
        let global = AlertRule::new(
            "slow",
            AlertCondition::ResponseTimeAbove { millis: 10.0 },
            Severity::Warning,
        );
        assert!(global.applies_to("any"));

        let mut scoped = global.clone().for_check("check-1");
        assert!(scoped.applies_to("check-1"));
        assert!(!scoped.applies_to("check-2"));

        scoped.enabled = false;
        assert!(!scoped.applies_to("check-1"));
    }

    #[test]
    fn test_condition_serialization() {
        let cond = AlertCondition::FailureRateAbove { threshold: 0.3, window: 10 };
        let json = serde_json::to_string(&cond).unwrap();
        assert!(json.contains("\"kind\":\"failure_rate_above\""));
        assert_eq!(serde_json::to_string(&MonitorType::WebSocket).unwrap(), "\"websocket\"");
    }
}
