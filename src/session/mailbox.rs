//! Durable per-session notification inbox.
//!
//! Deposits, drains and acks each run inside one session mutation, so the
//! idempotency, dedupe and staleness rules hold even with several writers
//! racing for the same session.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use super::fs_store::{FsSessionStore, LockOutcome};
use super::lock::SessionLease;
use super::types::{SessionKey, SessionRecord, SystemEvent};
use crate::error::Result;

/// Default age after which `suppress_if_stale` events are dropped.
pub const DEFAULT_STALENESS_HOURS: i64 = 24;

/// What a deposit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositOutcome {
    /// New entry appended.
    Added,
    /// Replaced an older entry with the same `dedupe_key`.
    Replaced,
    /// An entry with this `event_id` is already present.
    Duplicate,
    /// The event was already stale and was dropped.
    Stale,
}

impl DepositOutcome {
    /// Whether the event is now in the mailbox because of this deposit.
    #[must_use]
    pub fn accepted(self) -> bool {
        matches!(self, Self::Added | Self::Replaced)
    }
}

/// Current mailbox contents plus the ids to ack once they are consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailboxDrain {
    pub events: Vec<SystemEvent>,
    pub ack_ids: Vec<String>,
}

impl MailboxDrain {
    /// Whether there is nothing to show.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Render the entries as a text block suitable for prompt injection.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&format!(
                "- [{}] {} ({}): {}\n",
                event.timestamp.format("%Y-%m-%d %H:%M UTC"),
                event.event_type,
                event.source_session_id,
                event.summary
            ));
            if !event.detail.is_empty() {
                for line in event.detail.lines() {
                    out.push_str("    ");
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out
    }
}

fn drop_stale(record: &mut SessionRecord, now: DateTime<Utc>, window: Duration) -> usize {
    let before = record.mailbox.len();
    record.mailbox.retain(|e| !e.is_stale(now, window));
    before - record.mailbox.len()
}

/// Deposit `event` into `record`'s mailbox.
pub fn deposit_into(
    record: &mut SessionRecord,
    event: SystemEvent,
    now: DateTime<Utc>,
    window: Duration,
) -> DepositOutcome {
    drop_stale(record, now, window);
    if record.mailbox.iter().any(|e| e.event_id == event.event_id) {
        return DepositOutcome::Duplicate;
    }
    if event.is_stale(now, window) {
        return DepositOutcome::Stale;
    }

    let mut outcome = DepositOutcome::Added;
    if let Some(key) = event.dedupe_key.as_deref() {
        let before = record.mailbox.len();
        record
            .mailbox
            .retain(|e| e.dedupe_key.as_deref() != Some(key));
        if record.mailbox.len() != before {
            outcome = DepositOutcome::Replaced;
        }
    }
    record.mailbox.push(event);
    outcome
}

/// Drop stale entries and return what remains.
pub fn drain_from(record: &mut SessionRecord, now: DateTime<Utc>, window: Duration) -> MailboxDrain {
    drop_stale(record, now, window);
    MailboxDrain {
        ack_ids: record.mailbox.iter().map(|e| e.event_id.clone()).collect(),
        events: record.mailbox.clone(),
    }
}

/// Remove entries whose id is in `ids`. Returns how many were removed.
pub fn ack_in(record: &mut SessionRecord, ids: &[String]) -> usize {
    let ids: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let before = record.mailbox.len();
    record.mailbox.retain(|e| !ids.contains(e.event_id.as_str()));
    before - record.mailbox.len()
}

/// Mailbox operations over a session store.
#[derive(Debug, Clone)]
pub struct Mailbox {
    store: Arc<FsSessionStore>,
    staleness: Duration,
}

impl Mailbox {
    /// Mailbox over `store` with the default 24h staleness window.
    pub fn new(store: Arc<FsSessionStore>) -> Self {
        Self {
            store,
            staleness: Duration::hours(DEFAULT_STALENESS_HOURS),
        }
    }

    /// Override the staleness window.
    pub fn with_staleness(mut self, window: Duration) -> Self {
        self.staleness = window;
        self
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<FsSessionStore> {
        &self.store
    }

    /// Deposit into the mailbox of `key`, creating the session if needed.
    ///
    /// `Acquired(true)` when the event was added or replaced an older one.
    ///
    /// # Errors
    ///
    /// Propagates store write failures.
    pub async fn deposit(&self, key: &SessionKey, event: SystemEvent) -> Result<LockOutcome<bool>> {
        let window = self.staleness;
        let outcome = self
            .store
            .mutate(key, |record| deposit_into(record, event, Utc::now(), window))
            .await?;
        Ok(match outcome {
            LockOutcome::Acquired(o) => LockOutcome::Acquired(log_deposit(&key.id, o)),
            LockOutcome::Busy => LockOutcome::Busy,
        })
    }

    /// [`deposit`](Self::deposit) under an already-held lease.
    ///
    /// # Errors
    ///
    /// Propagates store write failures.
    pub fn deposit_with_lease(
        &self,
        lease: &SessionLease,
        key: &SessionKey,
        event: SystemEvent,
    ) -> Result<bool> {
        let window = self.staleness;
        let outcome = self
            .store
            .mutate_with_lease(lease, key, |record| deposit_into(record, event, Utc::now(), window))?;
        Ok(log_deposit(&key.id, outcome))
    }

    /// Current non-stale entries and their ack ids. Absent sessions drain empty.
    ///
    /// # Errors
    ///
    /// Propagates store write failures.
    pub async fn drain(&self, session_id: &str) -> Result<LockOutcome<MailboxDrain>> {
        let window = self.staleness;
        let outcome = self
            .store
            .update(session_id, |record| drain_from(record, Utc::now(), window))
            .await?;
        Ok(match outcome {
            LockOutcome::Acquired(drain) => LockOutcome::Acquired(drain.unwrap_or_default()),
            LockOutcome::Busy => LockOutcome::Busy,
        })
    }

    /// Remove acknowledged entries. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Propagates store write failures.
    pub async fn ack(&self, session_id: &str, ids: &[String]) -> Result<LockOutcome<usize>> {
        let outcome = self
            .store
            .update(session_id, |record| ack_in(record, ids))
            .await?;
        Ok(match outcome {
            LockOutcome::Acquired(removed) => LockOutcome::Acquired(removed.unwrap_or(0)),
            LockOutcome::Busy => LockOutcome::Busy,
        })
    }

    /// [`ack`](Self::ack) under an already-held lease.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::VigilError::Session`] if `lease` is for
    /// another session, or a write error.
    pub fn ack_with_lease(
        &self,
        lease: &SessionLease,
        key: &SessionKey,
        ids: &[String],
    ) -> Result<usize> {
        self.store.mutate_with_lease(lease, key, |record| ack_in(record, ids))
    }
}

fn log_deposit(session_id: &str, outcome: DepositOutcome) -> bool {
    match outcome {
        DepositOutcome::Duplicate => {
            tracing::debug!(session_id, "mailbox deposit ignored: duplicate event id");
        }
        DepositOutcome::Stale => {
            tracing::debug!(session_id, "mailbox deposit dropped: event already stale");
        }
        DepositOutcome::Added | DepositOutcome::Replaced => {
            tracing::info!(session_id, ?outcome, "mailbox event deposited");
        }
    }
    outcome.accepted()
}
