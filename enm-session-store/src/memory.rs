//! In-process key/value store with per-entry expiry

use async_trait::async_trait;
use enm_session_core::{KeyValueStore, SessionResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Stored value with expiration
#[derive(Debug, Clone)]
struct StoreEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn new(value: serde_json::Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|duration| Instant::now() + duration),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Instant::now() >= expires_at)
            .unwrap_or(false)
    }
}

/// Key/value store living in process memory
///
/// Clones share the same entries, so one store can be handed to several
/// caches in the same process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, StoreEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|entry| !entry.is_expired()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed = removed, "Purged expired store entries");
        }
        removed
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> SessionResult<Option<serde_json::Value>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).map(StoreEntry::is_expired).unwrap_or(false) {
            entries.remove(key);
            debug!(key = key, "Store entry expired and removed");
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> SessionResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), StoreEntry::new(value, ttl));
        Ok(())
    }

    async fn remove(&self, key: &str) -> SessionResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false))
    }

    async fn ttl(&self, key: &str) -> SessionResult<Option<Duration>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.expires_at)
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new();
        store.set("operator_session", json!({"cookie": "abc"}), None).await.unwrap();

        assert_eq!(
            store.get("operator_session").await.unwrap(),
            Some(json!({"cookie": "abc"}))
        );
        assert!(store.has_key("operator_session").await.unwrap());
        assert_eq!(store.ttl("operator_session").await.unwrap(), None);

        assert!(store.remove("operator_session").await.unwrap());
        assert!(!store.remove("operator_session").await.unwrap());
        assert!(store.get("operator_session").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = MemoryStore::new();
        store
            .set("front-end", json!(false), Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(store.ttl("front-end").await.unwrap().is_some());
        assert_eq!(store.len().await, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(store.get("front-end").await.unwrap().is_none());
        assert!(!store.has_key("front-end").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("k", json!(1), None).await.unwrap();
        assert_eq!(other.get("k").await.unwrap(), Some(json!(1)));

        other
            .set("short", json!(1), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.purge_expired().await, 1);
    }
}
