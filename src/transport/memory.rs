//! In-memory loopback transport
//!
//! Stands in for the remote platform in tests and single-process setups.
//! Every handle cloned from a `MemoryConnector` shares the same scripted
//! behavior: failed opens, rejected credentials, failing pings or sends,
//! recorded outbound frames, and injected inbound frames.

use super::{Connector, Link};
use crate::error::{ConnectError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct LinkShared {
    inbound: Mutex<VecDeque<String>>,
    open: AtomicBool,
}

#[derive(Default)]
struct MemoryState {
    opens: AtomicUsize,
    fail_next_opens: AtomicU32,
    fail_all_opens: AtomicBool,
    reject_auth: AtomicBool,
    fail_pings: AtomicBool,
    fail_sends: AtomicBool,
    latency: Mutex<Duration>,
    close_delay: Mutex<Duration>,
    sent: Mutex<Vec<String>>,
    current: Mutex<Option<Arc<LinkShared>>>,
    last_token: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory connector with scriptable failures
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<MemoryState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful handshakes so far
    pub fn open_count(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Fail the next `n` open attempts with a network error
    pub fn fail_next_opens(&self, n: u32) {
        self.state.fail_next_opens.store(n, Ordering::SeqCst);
    }

    /// Fail every open attempt until cleared
    pub fn set_fail_opens(&self, fail: bool) {
        self.state.fail_all_opens.store(fail, Ordering::SeqCst);
    }

    /// Reject the presented credential during the handshake
    pub fn set_reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Simulated round-trip latency for pings
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.state.latency) = latency;
    }

    /// Time a link takes to finish closing
    pub fn set_close_delay(&self, delay: Duration) {
        *lock(&self.state.close_delay) = delay;
    }

    /// All frames sent over any link, oldest first
    pub fn sent_frames(&self) -> Vec<String> {
        lock(&self.state.sent).clone()
    }

    /// Queue an inbound frame on the current link; false if none is open
    pub fn inject(&self, text: impl Into<String>) -> bool {
        match lock(&self.state.current).as_ref() {
            Some(link) if link.open.load(Ordering::SeqCst) => {
                lock(&link.inbound).push_back(text.into());
                true
            }
            _ => false,
        }
    }

    /// Simulate the platform dropping the current link
    pub fn drop_link(&self) {
        if let Some(link) = lock(&self.state.current).as_ref() {
            link.open.store(false, Ordering::SeqCst);
        }
    }

    /// Token presented on the most recent open attempt
    pub fn last_token(&self) -> Option<String> {
        lock(&self.state.last_token).clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(
        &self,
        endpoint: &str,
        bearer_token: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn Link>> {
        *lock(&self.state.last_token) = Some(bearer_token.to_string());

        if self.state.reject_auth.load(Ordering::SeqCst) {
            return Err(ConnectError::Authentication(format!(
                "{}: credential rejected (401)",
                endpoint
            )));
        }

        let scripted = self
            .state
            .fail_next_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.state.fail_all_opens.load(Ordering::SeqCst) {
            return Err(ConnectError::Network(format!(
                "{}: connection refused",
                endpoint
            )));
        }

        let shared = Arc::new(LinkShared::default());
        shared.open.store(true, Ordering::SeqCst);
        *lock(&self.state.current) = Some(Arc::clone(&shared));
        self.state.opens.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(endpoint, "Memory link opened");

        Ok(Box::new(MemoryLink {
            shared,
            state: Arc::clone(&self.state),
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryLink {
    shared: Arc<LinkShared>,
    state: Arc<MemoryState>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(ConnectError::Network("link closed".to_string()));
        }
        if self.state.fail_sends.load(Ordering::SeqCst) {
            return Err(ConnectError::Network("send failed: broken pipe".to_string()));
        }
        lock(&self.state.sent).push(text);
        Ok(())
    }

    fn try_recv(&self) -> Option<String> {
        lock(&self.shared.inbound).pop_front()
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration> {
        if !self.is_open() {
            return Err(ConnectError::Network("link closed".to_string()));
        }
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(ConnectError::Network("ping failed: no pong".to_string()));
        }
        let latency = *lock(&self.state.latency);
        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ConnectError::Timeout(format!(
                "pong not received within {:?}",
                timeout
            )));
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(latency)
    }

    async fn close(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        let delay = *lock(&self.state.close_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }
}
