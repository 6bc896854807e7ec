//! Named locks
//!
//! `ProcessLocks` serialises tasks inside one process. `FileLocks` holds an
//! exclusive advisory lock on one file per name, so every process sharing the
//! directory takes part. The operating system releases the lock when the
//! holding handle is closed, which covers holders that crash.

use crate::file::encode_key;
use async_trait::async_trait;
use enm_session_core::{persistence_error, ErrorContext, LockGuard, NamedLocks, SessionError, SessionResult};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

fn lock_timeout_error(name: &str, timeout: Duration) -> SessionError {
    SessionError::Lock {
        name: name.to_string(),
        timeout_ms: timeout.as_millis() as u64,
        context: ErrorContext::new("locks")
            .with_operation("acquire")
            .with_suggestion("Another worker holds this lock, retry later"),
    }
}

/// Locks shared by the tasks of a single process
#[derive(Debug, Clone, Default)]
pub struct ProcessLocks {
    slots: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ProcessLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NamedLocks for ProcessLocks {
    async fn acquire(&self, name: &str, timeout: Duration) -> SessionResult<LockGuard> {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(name.to_string()).or_default())
        };

        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(LockGuard::new(name, move || drop(guard))),
            Err(_) => Err(lock_timeout_error(name, timeout)),
        }
    }
}

/// Cross-process locks backed by lock files
#[derive(Debug, Clone)]
pub struct FileLocks {
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileLocks {
    pub fn new<P: AsRef<Path>>(dir: P) -> SessionResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| persistence_error!(format!("Failed to create {}", dir.display()), "file_locks", e))?;
        Ok(Self {
            dir,
            poll_interval: Duration::from_millis(50),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", encode_key(name)))
    }

    fn open(&self, path: &Path) -> SessionResult<File> {
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| persistence_error!(format!("Failed to open lock file {}", path.display()), "file_locks", e))
    }
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[async_trait]
impl NamedLocks for FileLocks {
    async fn acquire(&self, name: &str, timeout: Duration) -> SessionResult<LockGuard> {
        let path = self.path_for(name);
        let deadline = Instant::now() + timeout;
        // The file stays in place; removing it would let a waiter lock an unlinked inode
        let file = self.open(&path)?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(lock = name, "Lock file acquired");
                    let lock_name = name.to_string();
                    return Ok(LockGuard::new(name, move || {
                        if let Err(e) = FileExt::unlock(&file) {
                            warn!(lock = %lock_name, error = %e, "Failed to release lock file");
                        }
                    }));
                }
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(lock_timeout_error(name, timeout));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    return Err(persistence_error!(
                        format!("Failed to lock {}", path.display()),
                        "file_locks",
                        e
                    ))
                }
            }
        }
    }
}
