//! Persistence and locking boundaries
//!
//! The session layer only needs a shared key/value store with optional expiry
//! and a named mutual-exclusion primitive. Concrete backends live in
//! `enm-session-store`.

use crate::error::SessionResult;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Shared key/value store with per-key expiry
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value; expired keys read as absent
    async fn get(&self, key: &str) -> SessionResult<Option<serde_json::Value>>;

    /// Store a value; `ttl = None` keeps it until removed
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> SessionResult<()>;

    /// Remove a key, returning whether it existed
    async fn remove(&self, key: &str) -> SessionResult<bool>;

    async fn has_key(&self, key: &str) -> SessionResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Remaining lifetime of a key, `None` when absent or without expiry
    async fn ttl(&self, key: &str) -> SessionResult<Option<Duration>>;
}

/// Held lock; released when dropped
pub struct LockGuard {
    name: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(name: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

/// Named mutual exclusion, possibly spanning processes
#[async_trait]
pub trait NamedLocks: Send + Sync {
    /// Wait up to `timeout` for the lock called `name`
    async fn acquire(&self, name: &str, timeout: Duration) -> SessionResult<LockGuard>;
}

/// Run `operation` while holding the named lock
pub async fn with_lock<F, T>(
    locks: &dyn NamedLocks,
    name: &str,
    timeout: Duration,
    operation: F,
) -> SessionResult<T>
where
    F: Future<Output = SessionResult<T>>,
{
    let _guard = locks.acquire(name, timeout).await?;
    tracing::trace!(lock = name, "Lock acquired");
    operation.await
}
