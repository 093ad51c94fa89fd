//! WebSocket transport backed by tokio-tungstenite
//!
//! The bearer token travels in the `Authorization` header of the upgrade
//! request. A reader task drains the socket: text frames go to an inbound
//! queue, pong frames complete the outstanding latency probe.

use super::{Connector, Link};
use crate::error::{ConnectError, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PING_PAYLOAD: &[u8] = b"langflow-connect";

/// Connector that opens WebSocket links (`wss://`, or `ws://` when allowed)
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(
        &self,
        endpoint: &str,
        bearer_token: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Link>> {
        let mut request = endpoint.into_client_request().map_err(|e| {
            ConnectError::Configuration(format!("invalid endpoint '{}': {}", endpoint, e))
        })?;
        let header = HeaderValue::from_str(&format!("Bearer {}", bearer_token))
            .map_err(|e| ConnectError::Authentication(format!("invalid token header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, header);

        let (ws, _response) = match tokio::time::timeout(timeout, connect_async(request)).await {
            Err(_) => {
                return Err(ConnectError::Timeout(format!(
                    "handshake with {} exceeded {:?}",
                    endpoint, timeout
                )))
            }
            Ok(Err(WsError::Http(response)))
                if response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                return Err(ConnectError::Authentication(format!(
                    "{} rejected token: {}",
                    endpoint,
                    response.status()
                )))
            }
            Ok(Err(e)) => return Err(ConnectError::Network(format!("{}: {}", endpoint, e))),
            Ok(Ok(pair)) => pair,
        };

        tracing::info!(endpoint, "WebSocket handshake complete");
        Ok(Box::new(WebSocketLink::spawn(ws)))
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

type PendingPong = Arc<StdMutex<Option<oneshot::Sender<()>>>>;

struct WebSocketLink {
    sink: Mutex<SplitSink<WsStream, Message>>,
    inbound: StdMutex<mpsc::UnboundedReceiver<String>>,
    pending_pong: PendingPong,
    open: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl WebSocketLink {
    fn spawn(ws: WsStream) -> Self {
        let (sink, mut stream) = ws.split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pending_pong: PendingPong = Arc::new(StdMutex::new(None));
        let open = Arc::new(AtomicBool::new(true));

        let reader = {
            let pending_pong = Arc::clone(&pending_pong);
            let open = Arc::clone(&open);
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            if inbound_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Binary(data)) => {
                            if let Ok(text) = String::from_utf8(data) {
                                if inbound_tx.send(text).is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(Message::Pong(_)) => {
                            let waiter = pending_pong
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .take();
                            if let Some(tx) = waiter {
                                let _ = tx.send(());
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            tracing::info!(?frame, "Remote closed WebSocket");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "WebSocket read failed");
                            break;
                        }
                    }
                }
                open.store(false, Ordering::SeqCst);
            })
        };

        Self {
            sink: Mutex::new(sink),
            inbound: StdMutex::new(inbound_rx),
            pending_pong,
            open,
            reader: StdMutex::new(Some(reader)),
        }
    }
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(ConnectError::Network("socket closed".to_string()));
        }
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| ConnectError::Network(format!("send failed: {}", e)))
    }

    fn try_recv(&self) -> Option<String> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration> {
        if !self.is_open() {
            return Err(ConnectError::Network("socket closed".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        *self
            .pending_pong
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let started = Instant::now();
        self.sink
            .lock()
            .await
            .send(Message::Ping(PING_PAYLOAD.to_vec()))
            .await
            .map_err(|e| ConnectError::Network(format!("ping failed: {}", e)))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(ConnectError::Network(
                "socket closed before pong".to_string(),
            )),
            Err(_) => Err(ConnectError::Timeout(format!(
                "pong not received within {:?}",
                timeout
            ))),
        }
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
            let _ = reader.await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}
