//! Probes for each monitor type
//!
//! A probe never fails with an error: every outcome, including an unreachable
//! target, is classified into a `CheckStatus`. The supervisor wraps each call
//! in the check's timeout and treats expiry as Critical.

use super::types::CheckStatus;
use crate::error::{ConnectError, Result};
use crate::session::{ConnectionSession, ConnectionState};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Result of one probe
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: CheckStatus,
    pub response_time_ms: f64,
    pub error: Option<String>,
    pub details: serde_json::Value,
}

impl ProbeOutcome {
    pub fn healthy(response_time_ms: f64) -> Self {
        Self {
            status: CheckStatus::Healthy,
            response_time_ms,
            error: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn critical(response_time_ms: f64, error: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Critical,
            response_time_ms,
            error: Some(error.into()),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_status(mut self, status: CheckStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_micros() as f64 / 1000.0
}

/// Probes a target once
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &str, timeout: Duration) -> ProbeOutcome;
}

/// HTTP GET probe: 2xx/3xx Healthy, 4xx Warning, 5xx Critical
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConnectError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// Map an HTTP status code to a check status
pub fn classify_http_status(code: u16) -> CheckStatus {
    match code {
        200..=399 => CheckStatus::Healthy,
        400..=499 => CheckStatus::Warning,
        _ => CheckStatus::Critical,
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, target: &str, timeout: Duration) -> ProbeOutcome {
        let started = Instant::now();
        match self.client.get(target).timeout(timeout).send().await {
            Ok(response) => {
                let code = response.status().as_u16();
                let status = classify_http_status(code);
                let outcome = ProbeOutcome::healthy(elapsed_ms(started))
                    .with_status(status)
                    .with_details(serde_json::json!({ "statusCode": code }));
                if status == CheckStatus::Healthy {
                    outcome
                } else {
                    ProbeOutcome {
                        error: Some(format!("HTTP {}", code)),
                        ..outcome
                    }
                }
            }
            Err(e) if e.is_timeout() => {
                ProbeOutcome::critical(elapsed_ms(started), format!("timed out after {:?}", timeout))
            }
            Err(e) => ProbeOutcome::critical(elapsed_ms(started), e.to_string()),
        }
    }
}

/// WebSocket handshake probe; the socket is closed right after the upgrade
#[derive(Debug, Default)]
pub struct WebSocketProber;

#[async_trait]
impl Prober for WebSocketProber {
    async fn probe(&self, target: &str, timeout: Duration) -> ProbeOutcome {
        let started = Instant::now();
        match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(target)).await {
            Ok(Ok((mut ws, _response))) => {
                let latency = elapsed_ms(started);
                let _ = ws.close(None).await;
                ProbeOutcome::healthy(latency)
            }
            Ok(Err(WsError::Http(response))) => {
                let code = response.status().as_u16();
                ProbeOutcome::critical(elapsed_ms(started), format!("upgrade rejected: HTTP {}", code))
                    .with_status(rejected_upgrade_status(code))
                    .with_details(serde_json::json!({ "statusCode": code }))
            }
            Ok(Err(e)) => ProbeOutcome::critical(elapsed_ms(started), e.to_string()),
            Err(_) => ProbeOutcome::critical(elapsed_ms(started), format!("timed out after {:?}", timeout)),
        }
    }
}

/// A rejected upgrade is never healthy, even on a 2xx/3xx answer
fn rejected_upgrade_status(code: u16) -> CheckStatus {
    match classify_http_status(code) {
        CheckStatus::Healthy => CheckStatus::Warning,
        other => other,
    }
}

/// ICMP echo through the system `ping` utility
#[derive(Debug, Default)]
pub struct PingProber;

/// Extract the round-trip time from `ping` output (`time=12.3 ms`)
pub fn parse_ping_time(output: &str) -> Option<f64> {
    let start = output.find("time=")? + "time=".len();
    let rest = &output[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, target: &str, timeout: Duration) -> ProbeOutcome {
        let started = Instant::now();
        let wait_secs = timeout.as_secs().max(1).to_string();
        let mut command = Command::new("ping");
        command
            .args(["-c", "1", "-W", &wait_secs, target])
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let rtt = parse_ping_time(&stdout).unwrap_or_else(|| elapsed_ms(started));
                ProbeOutcome::healthy(rtt)
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = if stderr.trim().is_empty() {
                    format!("{} unreachable", target)
                } else {
                    stderr.trim().to_string()
                };
                ProbeOutcome::critical(elapsed_ms(started), reason)
            }
            Ok(Err(e)) => ProbeOutcome {
                status: CheckStatus::Unknown,
                response_time_ms: elapsed_ms(started),
                error: Some(format!("failed to run ping: {}", e)),
                details: serde_json::Value::Null,
            },
            Err(_) => ProbeOutcome::critical(elapsed_ms(started), format!("timed out after {:?}", timeout)),
        }
    }
}

/// Reports the state of an attached `ConnectionSession`
pub struct ConnectionProber {
    session: Arc<ConnectionSession>,
}

impl ConnectionProber {
    pub fn new(session: Arc<ConnectionSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Prober for ConnectionProber {
    async fn probe(&self, _target: &str, _timeout: Duration) -> ProbeOutcome {
        let health = self.session.get_health().await;
        let state = self.session.state();
        let status = match state {
            ConnectionState::Connected => CheckStatus::Healthy,
            ConnectionState::Connecting | ConnectionState::Reconnecting => CheckStatus::Warning,
            ConnectionState::Disconnected | ConnectionState::Failed => CheckStatus::Critical,
        };
        ProbeOutcome {
            status,
            response_time_ms: health.latency_ms.unwrap_or(0.0),
            error: (status != CheckStatus::Healthy).then(|| format!("connection {}", state)),
            details: serde_json::json!({
                "state": state,
                "errorCount": health.error_count,
                "reconnectAttempts": health.reconnect_attempts,
            }),
        }
    }
}

/// Prober backed by an async closure, see [`probe_fn`]
pub struct FnProber<F> {
    f: F,
}

/// Adapt an async closure into a `Prober`
pub fn probe_fn<F, Fut>(f: F) -> FnProber<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProbeOutcome> + Send + 'static,
{
    FnProber { f }
}

#[async_trait]
impl<F, Fut> Prober for FnProber<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProbeOutcome> + Send + 'static,
{
    async fn probe(&self, target: &str, _timeout: Duration) -> ProbeOutcome {
        (self.f)(target.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::transport::memory::MemoryConnector;

    #[test]
    fn test_classify_http_status() {
        assert_eq!(classify_http_status(200), CheckStatus::Healthy);
        assert_eq!(classify_http_status(302), CheckStatus::Healthy);
        assert_eq!(classify_http_status(404), CheckStatus::Warning);
        assert_eq!(classify_http_status(503), CheckStatus::Critical);
    }

    #[test]
    fn test_parse_ping_time() {
        let out = "64 bytes from 127.0.0.1: icmp_seq=1 ttl=64 time=0.045 ms\n";
        assert_eq!(parse_ping_time(out), Some(0.045));
        assert_eq!(parse_ping_time("time=12 ms"), Some(12.0));
        assert_eq!(parse_ping_time("no reply"), None);
    }

    #[tokio::test]
    async fn test_http_probe_unreachable_is_critical() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = HttpProber::new().unwrap();
        let outcome = prober
            .probe(&format!("http://{}/health", addr), Duration::from_secs(2))
            .await;
        assert_eq!(outcome.status, CheckStatus::Critical);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_connection_prober_tracks_state() {
        let connector = MemoryConnector::new();
        let session = Arc::new(ConnectionSession::new(
            ConnectionConfig::new("wss://flow.test/ws", "secret"),
            connector,
        ));
        let prober = ConnectionProber::new(Arc::clone(&session));

        let outcome = prober.probe("connection", Duration::from_secs(1)).await;
        assert_eq!(outcome.status, CheckStatus::Critical);
        assert_eq!(outcome.details["state"], "disconnected");

        session.connect().await.unwrap();
        let outcome = prober.probe("connection", Duration::from_secs(1)).await;
        assert_eq!(outcome.status, CheckStatus::Healthy);
        assert!(outcome.error.is_none());
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_probe_fn_receives_target() {
        let prober = probe_fn(|target: String| async move {
            if target == "db" {
                ProbeOutcome::healthy(1.5)
            } else {
                ProbeOutcome::critical(0.0, "unknown")
            }
        });
        assert_eq!(prober.probe("db", Duration::from_secs(1)).await.status, CheckStatus::Healthy);
        assert_eq!(prober.probe("x", Duration::from_secs(1)).await.status, CheckStatus::Critical);
    }
}
