//! Task Manager: schedulable tasks kept in a human-editable document.
//!
//! - [`types`]: [`Task`], [`TaskList`] and their enums
//! - [`document`]: finding, parsing and rewriting the fenced task block
//! - [`schedule`]: next-run computation through pluggable evaluators
//! - [`manager`]: due selection, claiming, transitions and sweeps

pub mod document;
pub mod manager;
pub mod schedule;
pub mod types;

pub use document::{ParseOutcome, TaskDocument, parse_task_document, write_task_block};
pub use manager::{
    DEFAULT_PURGE_AFTER_DAYS, TaskTransition, claim, claim_in, get_due_tasks, heal_stuck_tasks,
    purge_stale_tasks, update_task_state,
};
pub use schedule::{ScheduleEngine, ScheduleEvaluator};
pub use types::{ExecutionMode, Task, TaskList, TaskState};
