//! Job-session retention sweep.
//!
//! Isolated task runs leave one `job` session each. The sweep archives job
//! sessions that have been idle for a while, deletes archived ones past the
//! retention window, and caps how many archived job sessions are kept.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::fs_store::{FsSessionStore, LockOutcome};
use super::types::{SessionState, SessionType};
use crate::error::Result;

/// Thresholds for the job-session sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Archive active job sessions untouched for this many hours.
    pub archive_after_hours: i64,
    /// Delete archived job sessions older than this many days.
    pub delete_after_days: i64,
    /// Keep at most this many archived job sessions.
    pub max_archived: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            archive_after_hours: 24,
            delete_after_days: 14,
            max_archived: 200,
        }
    }
}

impl RetentionPolicy {
    /// Idle time before an active job session is archived.
    pub fn archive_after(&self) -> Duration {
        Duration::try_hours(self.archive_after_hours.max(0)).unwrap_or(Duration::MAX)
    }

    /// Age at which an archived job session is deleted.
    pub fn delete_after(&self) -> Duration {
        Duration::try_days(self.delete_after_days.max(0)).unwrap_or(Duration::MAX)
    }
}

/// `now - age`, or the earliest representable time when that underflows.
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub archived: usize,
    pub deleted: usize,
    /// Sessions skipped because they were locked.
    pub busy: usize,
}

/// Archive and delete job sessions according to `policy`.
///
/// # Errors
///
/// Returns an error if the session directory cannot be listed or a record
/// cannot be written or removed.
pub async fn sweep_job_sessions(
    store: &FsSessionStore,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    let archive_cutoff = cutoff(now, policy.archive_after());
    let delete_cutoff = cutoff(now, policy.delete_after());

    let jobs: Vec<_> = store
        .list()?
        .into_iter()
        .filter(|r| r.session_type == SessionType::Job)
        .collect();

    let mut archived: Vec<(DateTime<Utc>, String)> = Vec::new();
    for record in jobs {
        match record.state {
            SessionState::Archived => {
                archived.push((record.archived_at.unwrap_or(record.updated_at), record.session_id));
            }
            SessionState::Active if record.updated_at < archive_cutoff => {
                match store.update(&record.session_id, |r| r.archive(now)).await? {
                    LockOutcome::Acquired(Some(())) => {
                        report.archived += 1;
                        archived.push((now, record.session_id));
                    }
                    LockOutcome::Acquired(None) => {}
                    LockOutcome::Busy => report.busy += 1,
                }
            }
            SessionState::Active => {}
        }
    }

    // Oldest first: expired ones go, then the surplus beyond the cap.
    archived.sort();
    let surplus = archived.len().saturating_sub(policy.max_archived);
    for (index, (archived_at, session_id)) in archived.iter().enumerate() {
        if *archived_at >= delete_cutoff && index >= surplus {
            continue;
        }
        match store.delete(session_id).await? {
            LockOutcome::Acquired(true) => report.deleted += 1,
            LockOutcome::Acquired(false) => {}
            LockOutcome::Busy => report.busy += 1,
        }
    }

    if report != SweepReport::default() {
        tracing::info!(
            archived = report.archived,
            deleted = report.deleted,
            busy = report.busy,
            "job session sweep finished"
        );
    }
    Ok(report)
}
