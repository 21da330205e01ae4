//! What a heartbeat tick should do, decided from the task document.

use chrono::{DateTime, Duration, Utc};

use crate::tasks::{ExecutionMode, ParseOutcome, Task, get_due_tasks};

/// Classification of one heartbeat tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickKind {
    /// No task block, or nothing due and no review owed.
    Idle,
    /// Tasks are ready to run, split by execution mode.
    StructuredDue { inline: Vec<Task>, isolated: Vec<Task> },
    /// Nothing due, but a periodic review of the task list is owed.
    StructuredReflect,
    /// The task block is unusable; the agent is asked to repair it.
    Corrupted { reason: String },
}

impl TickKind {
    /// Short label used in timelines and context traces.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::StructuredDue { .. } => "structured_due",
            Self::StructuredReflect => "structured_reflect",
            Self::Corrupted { .. } => "corrupted",
        }
    }
}

/// Whether a review is owed: enabled (`every` is non-zero) and none has
/// happened within `every`.
#[must_use]
pub fn reflection_due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, every: Duration) -> bool {
    every > Duration::zero() && last.is_none_or(|last| now - last >= every)
}

/// Classify a tick from the parsed document.
#[must_use]
pub fn classify_tick(document: &ParseOutcome, now: DateTime<Utc>, reflect: bool) -> TickKind {
    match document {
        ParseOutcome::Empty => TickKind::Idle,
        ParseOutcome::Corrupted { reason } => TickKind::Corrupted {
            reason: reason.clone(),
        },
        ParseOutcome::Ok(list) => {
            let (inline, isolated): (Vec<Task>, Vec<Task>) = get_due_tasks(list, now)
                .into_iter()
                .cloned()
                .partition(|t| t.execution_mode == ExecutionMode::Inline);
            if !inline.is_empty() || !isolated.is_empty() {
                TickKind::StructuredDue { inline, isolated }
            } else if reflect {
                TickKind::StructuredReflect
            } else {
                TickKind::Idle
            }
        }
    }
}
