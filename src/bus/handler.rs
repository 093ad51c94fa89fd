//! Participant handler capability

use super::types::Envelope;
use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;

/// Processes envelopes addressed to one participant
///
/// The returned value becomes the Response payload when the envelope was
/// sent with `requires_response`; `None` answers with `null`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<Option<serde_json::Value>>;
}

/// Handler backed by an async closure, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

/// Adapt an async closure into a `MessageHandler`
///
/// ```rust,ignore
/// bus.register_participant("echo", handler_fn(|env| async move {
///     Ok(Some(env.payload))
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<serde_json::Value>>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<serde_json::Value>>> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> Result<Option<serde_json::Value>> {
        (self.f)(envelope.clone()).await
    }
}
