//! File-backed key/value store
//!
//! One JSON document per key in a shared directory. Writes go through a
//! temporary file and a rename, so readers in other processes never observe a
//! half-written entry. Readers never delete: an expired or unreadable entry
//! reads as absent and stays on disk until a writer replaces or removes it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enm_session_core::{persistence_error, ErrorContext, KeyValueStore, SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Serialized form of one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDocument {
    value: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredDocument {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|expires_at| Utc::now() >= expires_at)
            .unwrap_or(false)
    }
}

/// Key/value store persisted under a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> SessionResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| persistence_error!(format!("Failed to create {}", root.display()), "file_store", e))?;

        info!("File store initialized at: {}", root.display());

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", encode_key(key)))
    }

    async fn read_document(&self, key: &str) -> SessionResult<Option<StoredDocument>> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(persistence_error!(
                    format!("Failed to read {}", path.display()),
                    "file_store",
                    e
                ))
            }
        };

        match serde_json::from_str::<StoredDocument>(&content) {
            Ok(document) if document.is_expired() => {
                debug!(key = key, "Stored entry expired");
                Ok(None)
            }
            Ok(document) => Ok(Some(document)),
            Err(e) => {
                warn!(key = key, error = %e, "Ignoring unreadable store entry");
                Ok(None)
            }
        }
    }
}

/// Map a key onto a safe file name; unusual bytes are percent-encoded
pub(crate) fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    if encoded.starts_with('.') {
        encoded.replace_range(0..1, "%2E");
    }
    encoded
}

async fn remove_file_if_exists(path: &Path) -> SessionResult<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(persistence_error!(
            format!("Failed to remove {}", path.display()),
            "file_store",
            e
        )),
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> SessionResult<Option<serde_json::Value>> {
        Ok(self.read_document(key).await?.map(|document| document.value))
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> SessionResult<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl).map_err(|e| {
                        persistence_error!(format!("Invalid ttl for '{}'", key), "file_store", e)
                    })?,
            ),
            None => None,
        };
        let document = StoredDocument { value, expires_at };
        let content = serde_json::to_vec_pretty(&document)?;

        let path = self.path_for(key);
        let temp_path = self.root.join(format!(
            ".{}.{}.{}.tmp",
            encode_key(key),
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| persistence_error!(format!("Failed to write entry '{}'", key), "file_store", e))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| persistence_error!(format!("Failed to commit entry '{}'", key), "file_store", e))?;

        debug!(key = key, ttl_ms = ?ttl.map(|t| t.as_millis()), "Stored entry");
        Ok(())
    }

    async fn remove(&self, key: &str) -> SessionResult<bool> {
        let existed = self.read_document(key).await?.is_some();
        remove_file_if_exists(&self.path_for(key)).await?;
        Ok(existed)
    }

    async fn ttl(&self, key: &str) -> SessionResult<Option<Duration>> {
        Ok(self
            .read_document(key)
            .await?
            .and_then(|document| document.expires_at)
            .and_then(|expires_at| (expires_at - Utc::now()).to_std().ok()))
    }
}
