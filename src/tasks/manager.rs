//! Task state machine: due selection, claiming, transitions, and sweeps.
//!
//! ```text
//!            start/claim            succeed (one-shot)
//!  pending ──────────────> running ───────────────────> done
//!     ^                      │  │
//!     │  succeed (scheduled) │  │ fail, retries exhausted (one-shot)
//!     ├──────────────────────┘  └──────────────────────> failed
//!     │  fail (retry left, or scheduled re-arm)             │
//!     ├─────────────────────────────────────────────────────┤
//!     │  release (running), reset (done/failed)             │
//!     └─────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};

use super::schedule::ScheduleEngine;
use super::types::{Task, TaskList, TaskState};
use crate::error::{Result, VigilError};

/// Default age after which finished one-shot tasks are purged.
pub const DEFAULT_PURGE_AFTER_DAYS: i64 = 7;

/// Base delay before a failed task with retries left becomes due again.
const RETRY_DELAY_MINUTES: i64 = 5;

/// A `running` task is considered abandoned once it has run this many times
/// longer than its longest legitimate run.
const STUCK_RUNNING_GRACE_FACTOR: i32 = 2;

/// A requested change to one task's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTransition {
    /// `pending → running` without the due check (claim does the check).
    Start,
    /// The run finished successfully.
    Succeed,
    /// The run failed with this error.
    Fail(String),
    /// `running → pending` without consuming a retry (lock busy, shutdown).
    Release,
    /// `done`/`failed → pending`, due immediately (manual re-run).
    Reset,
}

impl TaskTransition {
    fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Succeed => "succeed",
            Self::Fail(_) => "fail",
            Self::Release => "release",
            Self::Reset => "reset",
        }
    }
}

/// Enabled pending tasks whose `next_run_at` is unset or not in the future.
#[must_use]
pub fn get_due_tasks(list: &TaskList, now: DateTime<Utc>) -> Vec<&Task> {
    list.tasks.iter().filter(|t| t.is_due(now)).collect()
}

/// Exactly-once guard: re-check due-ness and move the task to `running`.
///
/// Returns `false` if the task was already claimed or is no longer due.
pub fn claim(task: &mut Task, now: DateTime<Utc>) -> bool {
    if !task.is_due(now) {
        return false;
    }
    start(task, now);
    true
}

fn start(task: &mut Task, now: DateTime<Utc>) {
    task.state = TaskState::Running;
    task.last_run_at = Some(now);
    task.run_id = Some(uuid::Uuid::new_v4().simple().to_string());
}

/// [`claim`] the task with `id` in `list`. Unknown ids return `false`.
pub fn claim_in(list: &mut TaskList, id: &str, now: DateTime<Utc>) -> bool {
    list.get_mut(id).is_some_and(|task| claim(task, now))
}

fn rearm(task: &mut Task, now: DateTime<Utc>, engine: &ScheduleEngine) -> Result<()> {
    let schedule = task.schedule.as_deref().unwrap_or_default();
    task.next_run_at = Some(engine.next_run(schedule, task.timezone.as_deref(), now)?);
    task.state = TaskState::Pending;
    Ok(())
}

/// Apply `transition` to `task`.
///
/// Scheduled tasks never end in `failed`: when a failure brings `retry` to
/// `max_retry`, the counter resets and the task re-arms for its next
/// occurrence. One-shot tasks become `failed` at that point.
///
/// # Errors
///
/// Returns [`VigilError::InvalidTransition`] when the transition is not
/// allowed from the current state, and [`VigilError::Schedule`] when a
/// scheduled task's next occurrence cannot be computed.
pub fn update_task_state(
    task: &mut Task,
    transition: TaskTransition,
    now: DateTime<Utc>,
    engine: &ScheduleEngine,
) -> Result<()> {
    let invalid = |t: &Task, tr: &TaskTransition| {
        VigilError::InvalidTransition(format!(
            "cannot {} task '{}' in state {}",
            tr.label(),
            t.id,
            t.state
        ))
    };

    match (task.state, &transition) {
        (TaskState::Pending, TaskTransition::Start) => start(task, now),
        (TaskState::Running, TaskTransition::Succeed) => {
            task.run_id = None;
            task.retry = 0;
            task.error_message = None;
            if task.is_scheduled() {
                rearm(task, now, engine)?;
            } else {
                task.state = TaskState::Done;
                task.next_run_at = None;
            }
        }
        (TaskState::Running, TaskTransition::Fail(error)) => {
            task.run_id = None;
            task.retry = task.retry.saturating_add(1);
            task.error_message = Some(error.clone());
            if task.retry >= task.max_retry {
                if task.is_scheduled() {
                    task.retry = 0;
                    rearm(task, now, engine)?;
                } else {
                    task.state = TaskState::Failed;
                    task.next_run_at = None;
                }
            } else {
                let delay = Duration::minutes(RETRY_DELAY_MINUTES * i64::from(task.retry));
                task.state = TaskState::Pending;
                task.next_run_at = Some(now + delay);
            }
        }
        (TaskState::Running, TaskTransition::Release) => {
            task.state = TaskState::Pending;
            task.run_id = None;
        }
        (TaskState::Done | TaskState::Failed, TaskTransition::Reset) => {
            task.state = TaskState::Pending;
            task.retry = 0;
            task.error_message = None;
            task.next_run_at = None;
        }
        _ => return Err(invalid(task, &transition)),
    }
    Ok(())
}

/// Remove finished one-shot tasks whose last activity is older than `retain_for`.
///
/// Scheduled tasks are never purged. Returns the number removed.
pub fn purge_stale_tasks(list: &mut TaskList, now: DateTime<Utc>, retain_for: Duration) -> usize {
    let Some(cutoff) = now.checked_sub_signed(retain_for) else {
        return 0;
    };
    let before = list.tasks.len();
    list.tasks.retain(|task| {
        let finished = !task.is_scheduled() && task.state.is_terminal();
        let last_activity = task.last_run_at.unwrap_or(task.created_at);
        !(finished && last_activity < cutoff)
    });
    before - list.tasks.len()
}

/// Repair tasks left in states they should not be in.
///
/// - Scheduled tasks found in `failed` (written by older versions or by
///   hand) are re-armed.
/// - `running` tasks are released back to `pending` once their run started
///   more than twice `max_run(task)` ago; the process running them is gone.
///   `max_run` is the longest a single run may legitimately take, retries
///   and backoff included.
///
/// Returns the number of tasks touched.
pub fn heal_stuck_tasks(
    list: &mut TaskList,
    now: DateTime<Utc>,
    engine: &ScheduleEngine,
    max_run: impl Fn(&Task) -> Duration,
) -> usize {
    let mut healed = 0;
    for task in &mut list.tasks {
        match task.state {
            TaskState::Failed if task.is_scheduled() => {
                task.retry = 0;
                match rearm(task, now, engine) {
                    Ok(()) => healed += 1,
                    Err(e) => tracing::warn!(task_id = %task.id, "cannot re-arm failed task: {e}"),
                }
            }
            TaskState::Running => {
                let abandoned_after = max_run(task)
                    .checked_mul(STUCK_RUNNING_GRACE_FACTOR)
                    .unwrap_or(Duration::MAX);
                let started = task.last_run_at.unwrap_or(task.created_at);
                if now.signed_duration_since(started) > abandoned_after {
                    tracing::warn!(task_id = %task.id, run_id = ?task.run_id, "releasing abandoned run");
                    task.state = TaskState::Pending;
                    task.run_id = None;
                    healed += 1;
                }
            }
            _ => {}
        }
    }
    healed
}
