//! Cross-process session cache
//!
//! Stores one `PersistedUser` per persistence key so that a worker started
//! later can adopt an authenticated session without logging in again. Every
//! read and write happens under the named lock `"{key}-session-key"`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use enm_session_core::{with_lock, KeyValueStore, NamedLocks, SessionResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const ADMINISTRATOR_SESSION_KEY: &str = "administrator_session";
pub const WORKLOAD_ADMIN_SESSION_KEY: &str = "workload_admin_session";

/// Default persistence key for a username
pub fn persistence_key(username: &str) -> String {
    format!("{}_session", username)
}

/// Name of the lock guarding a persistence key
pub fn lock_name(key: &str) -> String {
    format!("{}-session-key", key)
}

/// What a manager leaves behind for other processes
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedUser {
    pub username: String,
    pub base_url: String,
    /// Auth cookie value
    pub session_key: Option<String>,
    pub keep_password: bool,
    pub safe_request: bool,
    /// Base64 encoded, present only when `keep_password` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_password: Option<String>,
    pub persisted_at: DateTime<Utc>,
}

impl PersistedUser {
    pub fn encode_password(password: &str) -> String {
        STANDARD.encode(password.as_bytes())
    }

    pub fn password(&self) -> Option<String> {
        let encoded = self.encoded_password.as_deref()?;
        STANDARD
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }
}

impl std::fmt::Debug for PersistedUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedUser")
            .field("username", &self.username)
            .field("base_url", &self.base_url)
            .field("has_session_key", &self.session_key.is_some())
            .field("keep_password", &self.keep_password)
            .field("safe_request", &self.safe_request)
            .field("persisted_at", &self.persisted_at)
            .finish()
    }
}

#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn KeyValueStore>,
    locks: Arc<dyn NamedLocks>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

impl SessionCache {
    pub fn new(store: Arc<dyn KeyValueStore>, locks: Arc<dyn NamedLocks>, lock_timeout: Duration) -> Self {
        Self {
            store,
            locks,
            lock_timeout,
        }
    }

    /// Persist `user` under `key` with no expiry
    pub async fn save(&self, key: &str, user: &PersistedUser) -> SessionResult<()> {
        let value = serde_json::to_value(user)?;
        with_lock(self.locks.as_ref(), &lock_name(key), self.lock_timeout, async {
            self.store.set(key, value, None).await
        })
        .await?;
        debug!(key = key, username = %user.username, "Session persisted");
        Ok(())
    }

    /// Entry stored under `key`; an unreadable entry reads as absent
    pub async fn load(&self, key: &str) -> SessionResult<Option<PersistedUser>> {
        let value = with_lock(self.locks.as_ref(), &lock_name(key), self.lock_timeout, async {
            self.store.get(key).await
        })
        .await?;

        match value.map(serde_json::from_value::<PersistedUser>) {
            Some(Ok(user)) => Ok(Some(user)),
            Some(Err(e)) => {
                warn!(key = key, error = %e, "Ignoring unreadable persisted session");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub async fn remove(&self, key: &str) -> SessionResult<bool> {
        let removed = with_lock(self.locks.as_ref(), &lock_name(key), self.lock_timeout, async {
            self.store.remove(key).await
        })
        .await?;
        if removed {
            debug!(key = key, "Persisted session removed");
        }
        Ok(removed)
    }

    pub async fn contains(&self, key: &str) -> SessionResult<bool> {
        with_lock(self.locks.as_ref(), &lock_name(key), self.lock_timeout, async {
            self.store.has_key(key).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enm_session_store::{MemoryStore, ProcessLocks};
    use serde_json::json;

    fn cache(store: MemoryStore) -> SessionCache {
        SessionCache::new(
            Arc::new(store),
            Arc::new(ProcessLocks::new()),
            Duration::from_secs(1),
        )
    }

    fn user(password: Option<&str>) -> PersistedUser {
        PersistedUser {
            username: "operator".to_string(),
            base_url: "https://enm.example.com".to_string(),
            session_key: Some("token".to_string()),
            keep_password: password.is_some(),
            safe_request: false,
            encoded_password: password.map(PersistedUser::encode_password),
            persisted_at: Utc::now(),
        }
    }

    #[test]
    fn test_keys() {
        assert_eq!(persistence_key("operator"), "operator_session");
        assert_eq!(lock_name(ADMINISTRATOR_SESSION_KEY), "administrator_session-session-key");
    }

    #[test]
    fn test_password_encoding_and_redaction() {
        let user = user(Some("s3cret"));
        assert_eq!(user.encoded_password.as_deref(), Some("czNjcmV0"));
        assert_eq!(user.password().as_deref(), Some("s3cret"));
        assert!(!format!("{:?}", user).contains("s3cret"));
        assert!(!format!("{:?}", user).contains("czNjcmV0"));
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let cache = cache(MemoryStore::new());
        let key = persistence_key("operator");
        assert!(cache.load(&key).await.unwrap().is_none());

        let user = user(None);
        cache.save(&key, &user).await.unwrap();
        assert!(cache.contains(&key).await.unwrap());
        assert_eq!(cache.load(&key).await.unwrap(), Some(user));

        assert!(cache.remove(&key).await.unwrap());
        assert!(!cache.remove(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_entry_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .set("operator_session", json!({"unexpected": true}), None)
            .await
            .unwrap();
        let cache = cache(store);
        assert!(cache.load("operator_session").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_contains_waits_for_key_lock() {
        let locks = Arc::new(ProcessLocks::new());
        let cache = SessionCache::new(
            Arc::new(MemoryStore::new()),
            locks.clone(),
            Duration::from_millis(30),
        );
        let key = persistence_key("operator");
        cache.save(&key, &user(None)).await.unwrap();

        let held = locks.acquire(&lock_name(&key), Duration::from_millis(30)).await.unwrap();
        assert!(matches!(
            cache.contains(&key).await,
            Err(enm_session_core::SessionError::Lock { .. })
        ));

        drop(held);
        assert!(cache.contains(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_do_not_expire() {
        let store = MemoryStore::new();
        let cache = cache(store.clone());
        cache.save("operator_session", &user(None)).await.unwrap();
        assert_eq!(store.ttl("operator_session").await.unwrap(), None);
    }
}
