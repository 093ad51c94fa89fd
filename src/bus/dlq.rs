//! Dead letters: envelopes the bus could not deliver
//!
//! An envelope is dead-lettered when its target unregistered before the
//! envelope was processed, when a Response has nowhere to go, or when the
//! target handler failed, panicked, or timed out.

use super::types::{now_millis, Envelope};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// Why an envelope was dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// Target no longer registered when the envelope was dequeued
    UnknownTarget,
    /// Handler returned an error, panicked, or timed out
    HandlerFailed(String),
    /// Response whose original sender is gone
    OrphanedResponse,
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterReason::UnknownTarget => f.write_str("unknown target"),
            DeadLetterReason::HandlerFailed(reason) => write!(f, "handler failed: {}", reason),
            DeadLetterReason::OrphanedResponse => f.write_str("orphaned response"),
        }
    }
}

/// An undeliverable envelope with context
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub reason: DeadLetterReason,

    /// Unix timestamp in milliseconds when the envelope was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetter {
    pub fn new(envelope: Envelope, reason: DeadLetterReason) -> Self {
        Self {
            envelope,
            reason,
            dead_lettered_at: now_millis(),
        }
    }
}

/// Destination for dead letters
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    /// Record a dead letter
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of dead letters currently held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Most recent dead letters addressed to `target`
    async fn list_for_target(&self, target: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        Ok(self
            .list(usize::MAX)
            .await?
            .into_iter()
            .filter(|l| l.envelope.target == target)
            .take(limit)
            .collect())
    }
}

const DEFAULT_CAPACITY: usize = 1_000;

#[derive(Default)]
struct Shelf {
    letters: VecDeque<DeadLetter>,
    evicted: u64,
}

/// In-memory dead letter ring
///
/// Holds at most `capacity` letters (0 for no limit). Once full, each new
/// letter evicts the oldest one and the eviction is counted.
pub struct MemoryDeadLetters {
    shelf: Mutex<Shelf>,
    capacity: usize,
}

impl MemoryDeadLetters {
    pub fn new(capacity: usize) -> Self {
        Self {
            shelf: Mutex::new(Shelf::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Letters pushed out by newer ones since creation
    pub async fn evicted(&self) -> u64 {
        self.shelf.lock().await.evicted
    }

    /// Discard every letter addressed to `target`, returning how many went
    pub async fn purge_target(&self, target: &str) -> usize {
        let mut shelf = self.shelf.lock().await;
        let before = shelf.letters.len();
        shelf.letters.retain(|l| l.envelope.target != target);
        let purged = before - shelf.letters.len();
        if purged > 0 {
            tracing::info!(participant = %target, purged, "Dead letters purged");
        }
        purged
    }
}

impl Default for MemoryDeadLetters {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl DeadLetterHandler for MemoryDeadLetters {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            message_id = %letter.envelope.id,
            source = %letter.envelope.source,
            target = %letter.envelope.target,
            reason = %letter.reason,
            "Envelope dead-lettered"
        );

        let mut shelf = self.shelf.lock().await;
        if self.capacity > 0 && shelf.letters.len() == self.capacity {
            if let Some(oldest) = shelf.letters.pop_front() {
                shelf.evicted += 1;
                tracing::debug!(message_id = %oldest.envelope.id, "Oldest dead letter evicted");
            }
        }
        shelf.letters.push_back(letter);
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.shelf.lock().await.letters.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let shelf = self.shelf.lock().await;
        Ok(shelf.letters.iter().rev().take(limit).cloned().collect())
    }

    async fn list_for_target(&self, target: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        let shelf = self.shelf.lock().await;
        Ok(shelf
            .letters
            .iter()
            .rev()
            .filter(|l| l.envelope.target == target)
            .take(limit)
            .cloned()
            .collect())
    }
}
