//! Session Store & Mailbox.
//!
//! Crash-safe, checksummed, lock-protected persistence of conversation
//! state, plus a per-session inbox for results produced while nobody was
//! watching.
//!
//! - [`types`]: [`SessionRecord`], [`SessionKey`], [`SystemEvent`]
//! - [`codec`]: checksum embedding and verification
//! - [`lock`]: in-process plus cross-process session locks
//! - [`fs_store`]: atomic mutations with backup recovery
//! - [`mailbox`]: deposit / drain / ack
//! - [`retention`]: job-session archive and sweep

pub mod codec;
pub mod fs_store;
pub mod lock;
pub mod mailbox;
pub mod retention;
pub mod types;

pub use fs_store::{FsSessionStore, LockOutcome};
pub use lock::SessionLease;
pub use mailbox::{DepositOutcome, Mailbox, MailboxDrain};
pub use retention::{RetentionPolicy, SweepReport, sweep_job_sessions};
pub use types::{
    ContextTrace, EventPriority, HistoryMessage, MessageRole, SessionKey, SessionRecord,
    SessionState, SessionType, SystemEvent, TimelineEntry,
};

/// Filesystem-safe stem for a session id.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`.
pub(crate) fn file_stem(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stem_replaces_unsafe_characters() {
        assert_eq!(file_stem("ada.primary"), "ada.primary");
        assert_eq!(file_stem("ada.channel.#ops/alerts"), "ada.channel._ops_alerts");
    }
}
