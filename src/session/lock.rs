//! Two-level session locking.
//!
//! A session is locked in-process first (one `tokio::sync::Mutex` per
//! session id) and then across processes with a `{session}.lock` file
//! created via `create_new`. Both waits share one deadline; running out of
//! time yields `None` (busy), which callers treat as a normal outcome.
//!
//! The creator also holds an advisory `flock` on the lock file for the life
//! of the lease, so a live holder is never evicted however long it runs. A
//! lock file older than the stale threshold whose `flock` can be taken
//! belonged to a crashed process and is removed. Each file carries a
//! `pid nonce time` stamp; a lease only deletes the file that still carries
//! its own stamp. Dropping the [`SessionLease`] removes the lock file and
//! releases the in-process mutex.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fs2::FileExt;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use super::file_stem;
use crate::error::{Result, VigilError};

/// How often a contended lock file is re-checked.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default age after which an unheld lock file is considered abandoned.
pub const DEFAULT_STALE_LOCK_AFTER: Duration = Duration::from_secs(600);

/// Exclusive hold on one session, in this process and across processes.
#[derive(Debug)]
pub struct SessionLease {
    session_id: String,
    // Field order matters: the lock file goes before the in-process mutex
    // is released.
    _file: LockFileGuard,
    _local: OwnedMutexGuard<()>,
}

impl SessionLease {
    /// Id of the leased session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[derive(Debug)]
struct LockFileGuard {
    path: PathBuf,
    stamp: String,
    // Closing the handle releases the flock.
    _file: File,
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(current) if current == self.stamp => {
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => tracing::warn!(
                "session lock {} was taken over; leaving it in place",
                self.path.display()
            ),
            Err(_) => {}
        }
    }
}

/// Registry of per-session locks rooted at one session directory.
#[derive(Debug)]
pub struct SessionLocks {
    dir: PathBuf,
    stale_after: Duration,
    local: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    /// Locks for sessions stored under `dir`.
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the cross-process lock file for `session_id`.
    pub fn lock_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(session_id)))
    }

    fn local_mutex(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.local.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(session_id.to_owned()).or_default())
    }

    /// Acquire both lock levels for `session_id`, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when the session stays busy for the whole wait.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Lock`] if the lock file cannot be created for a
    /// reason other than contention.
    pub async fn acquire(&self, session_id: &str, timeout: Duration) -> Result<Option<SessionLease>> {
        let deadline = Instant::now() + timeout;

        let mutex = self.local_mutex(session_id);
        let local = match tokio::time::timeout_at(deadline, mutex.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!(session_id, "session busy in this process");
                return Ok(None);
            }
        };

        let path = self.lock_path(session_id);
        match acquire_lock_file(&path, deadline, self.stale_after).await? {
            Some(file) => Ok(Some(SessionLease {
                session_id: session_id.to_owned(),
                _file: file,
                _local: local,
            })),
            None => {
                tracing::debug!(session_id, "session locked by another process");
                Ok(None)
            }
        }
    }
}

async fn acquire_lock_file(
    path: &Path,
    deadline: Instant,
    stale_after: Duration,
) -> Result<Option<LockFileGuard>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VigilError::Lock(format!("failed to create lock directory {}: {e}", parent.display()))
        })?;
    }

    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                if file.try_lock_exclusive().is_ok() {
                    let stamp = format!(
                        "{} {} {}",
                        std::process::id(),
                        uuid::Uuid::new_v4().simple(),
                        chrono::Utc::now().to_rfc3339()
                    );
                    file.write_all(stamp.as_bytes()).map_err(|e| {
                        VigilError::Lock(format!("failed to stamp lock file {}: {e}", path.display()))
                    })?;
                    return Ok(Some(LockFileGuard {
                        path: path.to_path_buf(),
                        stamp,
                        _file: file,
                    }));
                }
                // An evictor grabbed the fresh file first; it will remove it.
                drop(file);
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if evict_stale_lock(path, stale_after) {
                    continue;
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(LOCK_POLL_INTERVAL).await;
            }
            Err(e) => {
                return Err(VigilError::Lock(format!(
                    "failed to create lock file {}: {e}",
                    path.display()
                )));
            }
        }
    }
}

/// Remove `path` if it is older than `stale_after` and nobody holds its
/// flock. Returns whether the caller should retry creating it.
fn evict_stale_lock(path: &Path, stale_after: Duration) -> bool {
    let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) else {
        return false;
    };
    let Ok(age) = SystemTime::now().duration_since(modified) else {
        return false;
    };
    if age <= stale_after {
        return false;
    }

    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
        Err(_) => return false,
    };
    if file.try_lock_exclusive().is_err() {
        return false;
    }
    let mut ours = String::new();
    if file.read_to_string(&mut ours).is_err() {
        return false;
    }
    // Another evictor may have replaced the file since it was opened.
    match std::fs::read_to_string(path) {
        Ok(current) if current == ours => {}
        _ => return true,
    }
    if std::fs::remove_file(path).is_ok() {
        tracing::warn!(
            "evicted stale session lock {} (age {}s)",
            path.display(),
            age.as_secs()
        );
    }
    true
}
