//! Check definition persistence
//!
//! Health check definitions and alert rules survive restarts when the
//! supervisor is given a `CheckStore`. Results and alerts are runtime
//! state and are never written.
//!
//! The saved document carries a format version. Loading accepts the
//! current version and unversioned documents, then normalizes the set:
//! duplicate check ids keep the last definition and rules scoped to a
//! check that no longer exists are dropped.

use super::types::{AlertRule, HealthCheck};
use crate::error::{ConnectError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Format version written by this crate
pub const CHECK_SET_VERSION: u32 = 1;

/// Everything a supervisor persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSet {
    /// Format version; 0 marks a document written before versioning
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

impl CheckSet {
    pub fn new(checks: Vec<HealthCheck>, rules: Vec<AlertRule>) -> Self {
        Self {
            version: CHECK_SET_VERSION,
            checks,
            rules,
        }
    }

    /// Upgrade to the current version and drop entries that cannot be used
    pub fn normalize(mut self) -> Result<Self> {
        if self.version > CHECK_SET_VERSION {
            return Err(ConnectError::Configuration(format!(
                "check set version {} is newer than supported version {}",
                self.version, CHECK_SET_VERSION
            )));
        }
        self.version = CHECK_SET_VERSION;

        let mut seen = HashSet::new();
        let mut checks: Vec<HealthCheck> = self
            .checks
            .into_iter()
            .rev()
            .filter(|c| seen.insert(c.id.clone()))
            .collect();
        checks.reverse();

        let before = self.rules.len();
        self.rules
            .retain(|r| r.check_id.as_ref().map_or(true, |id| seen.contains(id)));
        let dangling = before - self.rules.len();
        if dangling > 0 {
            tracing::warn!(dangling, "Dropped alert rules scoped to missing checks");
        }

        self.checks = checks;
        Ok(self)
    }
}

/// Persistence backend for check definitions and alert rules
#[async_trait]
pub trait CheckStore: Send + Sync {
    /// Replace the stored set
    async fn save(&self, set: &CheckSet) -> Result<()>;

    /// Read the stored set; nothing stored yet yields an empty set
    async fn load(&self) -> Result<CheckSet>;
}

#[async_trait]
impl<S: CheckStore + ?Sized> CheckStore for Arc<S> {
    async fn save(&self, set: &CheckSet) -> Result<()> {
        (**self).save(set).await
    }

    async fn load(&self) -> Result<CheckSet> {
        (**self).load().await
    }
}

fn io_failure(action: &str, path: &Path, e: std::io::Error) -> ConnectError {
    ConnectError::Configuration(format!("check store: cannot {} {}: {}", action, path.display(), e))
}

/// JSON document on disk
///
/// Writes go to a uniquely named sibling file that is renamed over the
/// target, so a crash mid-write leaves the previous document intact.
pub struct FileCheckStore {
    path: PathBuf,
}

impl FileCheckStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checks".to_string());
        self.path
            .with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl CheckStore for FileCheckStore {
    async fn save(&self, set: &CheckSet) -> Result<()> {
        let body = serde_json::to_vec_pretty(set)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_failure("create directory", dir, e))?;
        }

        let staging = self.staging_path();
        if let Err(e) = tokio::fs::write(&staging, &body).await {
            return Err(io_failure("write", &staging, e));
        }
        if let Err(e) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io_failure("replace", &self.path, e));
        }

        tracing::debug!(
            path = %self.path.display(),
            version = set.version,
            checks = set.checks.len(),
            rules = set.rules.len(),
            "Check definitions written"
        );
        Ok(())
    }

    async fn load(&self) -> Result<CheckSet> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(CheckSet::new(Vec::new(), Vec::new())),
            Err(e) => return Err(io_failure("read", &self.path, e)),
        };

        let raw: CheckSet = serde_json::from_slice(&body).map_err(|e| {
            ConnectError::Configuration(format!(
                "check store: {} is not a valid check set: {}",
                self.path.display(),
                e
            ))
        })?;
        let from_version = raw.version;
        let set = raw.normalize()?;

        tracing::debug!(
            path = %self.path.display(),
            from_version,
            checks = set.checks.len(),
            rules = set.rules.len(),
            "Check definitions read"
        );
        Ok(set)
    }
}

/// Process-local store with scriptable save failures
#[derive(Default)]
pub struct MemoryCheckStore {
    set: RwLock<Option<CheckSet>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryCheckStore {
    /// Reject every `save` until cleared
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of accepted saves
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckStore for MemoryCheckStore {
    async fn save(&self, set: &CheckSet) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ConnectError::Configuration(
                "check store: write rejected".to_string(),
            ));
        }
        *self.set.write().await = Some(set.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self) -> Result<CheckSet> {
        match self.set.read().await.clone() {
            Some(set) => set.normalize(),
            None => Ok(CheckSet::new(Vec::new(), Vec::new())),
        }
    }
}
