//! Filesystem-backed, checksummed session store.
//!
//! Each session is stored as `{dir}/{session}.json` with the previous
//! generation kept at `{session}.json.bak`. Every mutation runs as one unit
//! under the session lease:
//!
//! 1. read the current record (falling back to the backup),
//! 2. apply the caller's change,
//! 3. bump `revision` and embed a fresh checksum,
//! 4. write a temp file, fsync, rotate current to backup, rename into place.
//!
//! Mutations that leave an existing record unchanged are not written.
//!
//! # Examples
//!
//! ```no_run
//! # async fn demo() -> vigil::error::Result<()> {
//! use vigil::session::{FsSessionStore, SessionKey};
//!
//! let store = FsSessionStore::new("/tmp/vigil-sessions")?;
//! let key = SessionKey::primary("ada");
//! let outcome = store
//!     .mutate(&key, |record| record.variables.insert("seen".into(), true.into()))
//!     .await?;
//! assert!(!outcome.is_busy());
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use super::codec;
use super::file_stem;
use super::lock::{DEFAULT_STALE_LOCK_AFTER, SessionLease, SessionLocks};
use super::types::{DEFAULT_TIMELINE_CAP, SessionKey, SessionRecord};
use crate::error::{Result, VigilError};
use crate::observability::{FIELD_OPERATION, FIELD_SESSION_ID, SPAN_SESSION_OPERATION};
use crate::persist;

/// Default bound on how long a mutation waits for the session lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of an operation that needs a session lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome<T> {
    /// The lock was acquired and the operation ran.
    Acquired(T),
    /// Someone else held the session for the whole wait.
    Busy,
}

impl<T> LockOutcome<T> {
    /// Whether the operation was skipped because the session was busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }

    /// The operation's value, if it ran.
    pub fn acquired(self) -> Option<T> {
        match self {
            Self::Acquired(value) => Some(value),
            Self::Busy => None,
        }
    }
}

/// Filesystem session store with two-level locking and backup recovery.
#[derive(Debug)]
pub struct FsSessionStore {
    dir: PathBuf,
    locks: SessionLocks,
    lock_timeout: Duration,
    timeline_cap: usize,
}

impl FsSessionStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Session`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            VigilError::Session(format!(
                "failed to create session directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            locks: SessionLocks::new(&dir, DEFAULT_STALE_LOCK_AFTER),
            dir,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            timeline_cap: DEFAULT_TIMELINE_CAP,
        })
    }

    /// Override how long mutations wait for the session lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Override the age after which lock files are evicted as stale.
    pub fn with_stale_lock_after(mut self, stale_after: Duration) -> Self {
        self.locks = SessionLocks::new(&self.dir, stale_after);
        self
    }

    /// Override the timeline ring-buffer capacity.
    pub fn with_timeline_cap(mut self, cap: usize) -> Self {
        self.timeline_cap = cap.max(1);
        self
    }

    /// Session directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Timeline capacity applied on every write.
    pub fn timeline_cap(&self) -> usize {
        self.timeline_cap
    }

    /// Path of the current record for `session_id`.
    pub fn record_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(session_id)))
    }

    /// Hold `session_id` exclusively across several steps.
    ///
    /// Returns `Ok(None)` if the session stays busy for `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Lock`] on lock-file I/O failure.
    pub async fn lease(&self, session_id: &str, timeout: Duration) -> Result<Option<SessionLease>> {
        self.locks.acquire(session_id, timeout).await
    }

    async fn lease_default(&self, session_id: &str) -> Result<Option<SessionLease>> {
        self.lease(session_id, self.lock_timeout).await
    }

    /// Load a record under the session lock.
    ///
    /// `Acquired(None)` means absent, including when both the current file
    /// and its backup are unusable (logged).
    ///
    /// # Errors
    ///
    /// Only lock-file I/O failures are errors.
    pub async fn load(&self, session_id: &str) -> Result<LockOutcome<Option<SessionRecord>>> {
        let Some(lease) = self.lease_default(session_id).await? else {
            return Ok(LockOutcome::Busy);
        };
        Ok(LockOutcome::Acquired(self.load_with_lease(&lease)))
    }

    /// Load the leased session's record.
    pub fn load_with_lease(&self, lease: &SessionLease) -> Option<SessionRecord> {
        self.read_verified(lease.session_id())
    }

    /// Whether a record file (or its backup) exists.
    pub fn exists(&self, session_id: &str) -> bool {
        let path = self.record_path(session_id);
        path.exists() || persist::backup_path_for(&path).exists()
    }

    /// Apply `f` to the record for `key`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written; the on-disk state
    /// is left at the previous generation.
    pub async fn mutate<R>(
        &self,
        key: &SessionKey,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<LockOutcome<R>> {
        let Some(lease) = self.lease_default(&key.id).await? else {
            return Ok(LockOutcome::Busy);
        };
        self.mutate_with_lease(&lease, key, f).map(LockOutcome::Acquired)
    }

    /// [`mutate`](Self::mutate) under an already-held lease.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Session`] if `lease` is for another session,
    /// or a write error.
    pub fn mutate_with_lease<R>(
        &self,
        lease: &SessionLease,
        key: &SessionKey,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<R> {
        check_lease(lease, &key.id)?;
        let out = self.apply(&key.id, Some(key), f)?;
        out.ok_or_else(|| VigilError::Session(format!("session {} vanished", key.id)))
    }

    /// Apply `f` to an existing record; `Acquired(None)` if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub async fn update<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<LockOutcome<Option<R>>> {
        let Some(lease) = self.lease_default(session_id).await? else {
            return Ok(LockOutcome::Busy);
        };
        self.update_with_lease(&lease, f).map(LockOutcome::Acquired)
    }

    /// [`update`](Self::update) under an already-held lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn update_with_lease<R>(
        &self,
        lease: &SessionLease,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<Option<R>> {
        self.apply(lease.session_id(), None, f)
    }

    /// Remove a record and its backup. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] if a file exists but cannot be removed.
    pub async fn delete(&self, session_id: &str) -> Result<LockOutcome<bool>> {
        let Some(_lease) = self.lease_default(session_id).await? else {
            return Ok(LockOutcome::Busy);
        };
        let path = self.record_path(session_id);
        let mut removed = false;
        for p in [persist::backup_path_for(&path), path] {
            match std::fs::remove_file(&p) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(LockOutcome::Acquired(removed))
    }

    /// All readable records, without locking.
    ///
    /// Each session is read the way [`load`](Self::load) reads it: the
    /// current file first, then its backup. A session caught between the
    /// two renames of a write, or one whose current file was lost, is
    /// still listed from its backup.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Io`] if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        let mut paths = BTreeSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if name.ends_with(".json") {
                paths.insert(path);
            } else if let Some(current) = name.strip_suffix(".bak")
                && current.ends_with(".json")
            {
                paths.insert(path.with_file_name(current));
            }
        }
        let mut records: Vec<SessionRecord> =
            paths.iter().filter_map(|p| read_with_fallback(p)).collect();
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(records)
    }

    fn read_verified(&self, session_id: &str) -> Option<SessionRecord> {
        read_with_fallback(&self.record_path(session_id))
    }

    fn apply<R>(
        &self,
        session_id: &str,
        create: Option<&SessionKey>,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Result<Option<R>> {
        let _span = tracing::debug_span!(
            SPAN_SESSION_OPERATION,
            { FIELD_OPERATION } = "mutate",
            { FIELD_SESSION_ID } = session_id
        )
        .entered();
        let now = Utc::now();
        let (mut record, before) = match self.read_verified(session_id) {
            Some(record) => {
                let before = record.clone();
                (record, Some(before))
            }
            None => match create {
                Some(key) => (SessionRecord::new(key, now), None),
                None => return Ok(None),
            },
        };

        let out = f(&mut record);
        if before.as_ref() == Some(&record) {
            return Ok(Some(out));
        }

        record.revision = record.revision.saturating_add(1);
        record.updated_at = now;
        while record.timeline.len() > self.timeline_cap {
            record.timeline.pop_front();
        }
        let text = codec::encode(&record)?;
        let path = self.record_path(session_id);
        persist::write_atomic(&path, text.as_bytes(), Some(&persist::backup_path_for(&path)))
            .map_err(|e| {
                VigilError::Session(format!("failed to persist session {session_id}: {e}"))
            })?;
        tracing::debug!(revision = record.revision, "session persisted");
        Ok(Some(out))
    }
}

fn check_lease(lease: &SessionLease, session_id: &str) -> Result<()> {
    if lease.session_id() == session_id {
        Ok(())
    } else {
        Err(VigilError::Session(format!(
            "lease for {} used to mutate {session_id}",
            lease.session_id()
        )))
    }
}

/// Read `path`, falling back to its backup. Never fails: unusable or
/// missing files yield `None`, with corruption logged.
fn read_with_fallback(path: &Path) -> Option<SessionRecord> {
    let read = |p: &Path| -> Option<std::result::Result<SessionRecord, String>> {
        match std::fs::read_to_string(p) {
            Ok(text) => Some(codec::decode(&text).map_err(|e| e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => Some(Err(e.to_string())),
        }
    };

    let backup = persist::backup_path_for(path);
    match read(path) {
        Some(Ok(record)) => return Some(record),
        Some(Err(e)) => tracing::warn!(
            "session file {} unusable ({e}), trying backup",
            path.display()
        ),
        None => {}
    }
    match read(&backup) {
        Some(Ok(record)) => {
            tracing::warn!(
                "recovered session {} from backup at revision {}",
                record.session_id,
                record.revision
            );
            Some(record)
        }
        Some(Err(e)) => {
            tracing::error!(
                "session backup {} unusable ({e}); treating session as absent",
                backup.display()
            );
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::session::types::{SessionType, TimelineEntry};

    fn store() -> (tempfile::TempDir, FsSessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsSessionStore::new(dir.path())
            .expect("store")
            .with_lock_timeout(Duration::from_millis(50));
        (dir, store)
    }

    fn set(name: &str, value: i64) -> impl FnOnce(&mut SessionRecord) {
        let name = name.to_owned();
        move |record: &mut SessionRecord| {
            record.variables.insert(name, value.into());
        }
    }

    #[tokio::test]
    async fn mutate_creates_then_increments_revision() {
        let (_dir, store) = store();
        let key = SessionKey::primary("ada");

        store.mutate(&key, set("a", 1)).await.unwrap();
        store.mutate(&key, set("a", 2)).await.unwrap();

        let record = store.load(&key.id).await.unwrap().acquired().flatten().unwrap();
        assert_eq!(record.revision, 2);
        assert_eq!(record.agent_name, "ada");
        assert_eq!(record.session_type, SessionType::Primary);
        assert_eq!(record.variables["a"], 2);
    }

    #[tokio::test]
    async fn unchanged_mutation_is_not_written() {
        let (_dir, store) = store();
        let key = SessionKey::primary("ada");
        store.mutate(&key, set("a", 1)).await.unwrap();
        store.mutate(&key, |_| ()).await.unwrap();

        let record = store.load(&key.id).await.unwrap().acquired().flatten().unwrap();
        assert_eq!(record.revision, 1);
    }

    #[tokio::test]
    async fn update_skips_absent_records() {
        let (_dir, store) = store();
        let outcome = store.update("nobody.primary", |r| r.revision).await.unwrap();
        assert_eq!(outcome, LockOutcome::Acquired(None));
        assert!(!store.exists("nobody.primary"));
    }

    #[tokio::test]
    async fn corrupted_current_falls_back_to_backup() {
        let (_dir, store) = store();
        let key = SessionKey::primary("ada");
        store.mutate(&key, set("a", 1)).await.unwrap();
        store.mutate(&key, set("a", 2)).await.unwrap();

        let path = store.record_path(&key.id);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &text[..text.len() / 2]).unwrap();

        let record = store.load(&key.id).await.unwrap().acquired().flatten().unwrap();
        assert_eq!(record.revision, 1);
        assert_eq!(record.variables["a"], 1);
    }

    #[tokio::test]
    async fn checksum_mismatch_falls_back_to_backup() {
        let (_dir, store) = store();
        let key = SessionKey::primary("ada");
        store.mutate(&key, set("a", 1)).await.unwrap();
        store.mutate(&key, set("a", 2)).await.unwrap();

        let path = store.record_path(&key.id);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"a\": 2", "\"a\": 3")).unwrap();

        let record = store.load(&key.id).await.unwrap().acquired().flatten().unwrap();
        assert_eq!(record.variables["a"], 1);
    }

    #[tokio::test]
    async fn both_generations_corrupted_reads_as_absent() {
        let (_dir, store) = store();
        let key = SessionKey::primary("ada");
        store.mutate(&key, set("a", 1)).await.unwrap();
        store.mutate(&key, set("a", 2)).await.unwrap();

        let path = store.record_path(&key.id);
        std::fs::write(&path, "garbage").unwrap();
        std::fs::write(persist::backup_path_for(&path), "{}").unwrap();

        let outcome = store.load(&key.id).await.unwrap();
        assert_eq!(outcome, LockOutcome::Acquired(None));
    }

    #[tokio::test]
    async fn held_lease_makes_mutation_busy() {
        let (_dir, store) = store();
        let key = SessionKey::primary("ada");
        let lease = store.lease(&key.id, Duration::from_millis(50)).await.unwrap().unwrap();

        let outcome = store.mutate(&key, set("a", 1)).await.unwrap();
        assert!(outcome.is_busy());

        store.mutate_with_lease(&lease, &key, set("a", 7)).unwrap();
        drop(lease);
        let record = store.load(&key.id).await.unwrap().acquired().flatten().unwrap();
        assert_eq!(record.variables["a"], 7);
    }

    #[tokio::test]
    async fn lease_for_other_session_is_rejected() {
        let (_dir, store) = store();
        let lease = store.lease("x", Duration::from_millis(50)).await.unwrap().unwrap();
        let key = SessionKey::primary("ada");
        assert!(store.mutate_with_lease(&lease, &key, |_| ()).is_err());
    }

    #[tokio::test]
    async fn timeline_cap_applies_on_write() {
        let (_dir, store) = store();
        let store = store.with_timeline_cap(2);
        let key = SessionKey::primary("ada");
        store
            .mutate(&key, |r| {
                for i in 0..5 {
                    r.timeline.push_back(TimelineEntry::new(Utc::now(), format!("e{i}"), ""));
                }
            })
            .await
            .unwrap();
        let record = store.load(&key.id).await.unwrap().acquired().flatten().unwrap();
        assert_eq!(record.timeline.len(), 2);
        assert_eq!(record.timeline[0].kind, "e3");
    }

    #[tokio::test]
    async fn list_and_delete() {
        let (_dir, store) = store();
        let a = SessionKey::primary("ada");
        let b = SessionKey::job("ada");
        store.mutate(&a, set("x", 1)).await.unwrap();
        store.mutate(&b, set("x", 1)).await.unwrap();
        store.mutate(&b, set("x", 2)).await.unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.session_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id));

        assert_eq!(store.delete(&b.id).await.unwrap(), LockOutcome::Acquired(true));
        assert!(!store.exists(&b.id));
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_reads_sessions_left_only_in_backup() {
        let (_dir, store) = store();
        let a = SessionKey::primary("ada");
        let b = SessionKey::primary("bob");
        store.mutate(&a, set("x", 1)).await.unwrap();
        store.mutate(&a, set("x", 2)).await.unwrap();
        store.mutate(&b, set("x", 1)).await.unwrap();
        store.mutate(&b, set("x", 2)).await.unwrap();

        // ada mid-write: current renamed to backup, new file not yet in place.
        let ada = store.record_path(&a.id);
        std::fs::rename(&ada, persist::backup_path_for(&ada)).unwrap();
        // bob's current file is torn.
        std::fs::write(store.record_path(&b.id), "{\"session_id\":").unwrap();

        let records = store.list().unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(ids, [a.id.as_str(), b.id.as_str()]);
        assert_eq!(records[0].variables["x"], 2);
        assert_eq!(records[1].variables["x"], 1);
    }
}
