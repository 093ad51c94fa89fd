//! Transport traits: the socket abstraction beneath `ConnectionSession`
//!
//! A `Connector` performs the authenticated handshake and yields a `Link`,
//! the live duplex socket. Backends (WebSocket, in-memory) implement both
//! traits so the session logic never touches a concrete socket type.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub mod websocket;

/// Opens authenticated links to the remote platform
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake, presenting `bearer_token`, within `timeout`
    ///
    /// A rejected credential maps to `ConnectError::Authentication`; every
    /// other failure, including the timeout, is a transient network error.
    async fn open(
        &self,
        endpoint: &str,
        bearer_token: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Link>>;

    /// Connector name (e.g., "websocket", "memory")
    fn name(&self) -> &str;
}

/// A live duplex socket
#[async_trait]
pub trait Link: Send + Sync {
    /// Send one text frame
    async fn send_text(&self, text: String) -> Result<()>;

    /// Take the next pending inbound text frame without waiting
    fn try_recv(&self) -> Option<String>;

    /// Measure a round trip to the peer
    async fn ping(&self, timeout: Duration) -> Result<Duration>;

    /// Close the socket; idempotent
    async fn close(&self);

    /// Whether the socket is still open as far as the transport knows
    fn is_open(&self) -> bool;
}
