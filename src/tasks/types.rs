//! Task and task-list types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current task-list schema version.
pub const TASK_LIST_VERSION: u32 = 1;

/// Default per-task execution timeout.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

/// Default retry ceiling before a task re-arms (scheduled) or fails (one-shot).
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// Where a task's turn runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Merged with other inline tasks into one turn on the agent's primary session.
    #[default]
    Inline,
    /// Runs alone in a dedicated ephemeral job session.
    Isolated,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => write!(f, "inline"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskState {
    /// `done` and `failed` are terminal for one-shot tasks.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A schedulable unit of agent work.
///
/// A task with a `schedule` recurs; one without runs once. Recurring tasks
/// never stay in [`TaskState::Failed`]: once retries are exhausted they
/// re-arm for their next occurrence instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier, unique within its list.
    pub id: String,
    /// Short human-readable title.
    pub title: String,
    /// Instructions handed to the agent when the task runs.
    #[serde(default)]
    pub description: String,
    /// Who created the task ("user", "agent", ...).
    #[serde(default = "default_source")]
    pub source: String,
    /// Disabled tasks are never due.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Interval string (`"30m"`) or cron expression; `None` for one-shot tasks.
    #[serde(default)]
    pub schedule: Option<String>,
    /// IANA timezone used to evaluate cron schedules (UTC when unset).
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    /// Token of the claim currently running this task. Set on claim,
    /// cleared when the run is recorded or released.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// `None` means due immediately.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Failures since the last success or re-arm.
    #[serde(default)]
    pub retry: u32,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_source() -> String {
    "user".to_owned()
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

impl Task {
    /// Create an enabled, pending, one-shot inline task.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            source: default_source(),
            enabled: true,
            schedule: None,
            timezone: None,
            execution_mode: ExecutionMode::Inline,
            state: TaskState::Pending,
            last_run_at: None,
            run_id: None,
            next_run_at: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            retry: 0,
            max_retry: DEFAULT_MAX_RETRY,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    /// Set the instructions.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Make the task recurring.
    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// Set the timezone used for cron evaluation.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Set the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    /// Set the next run time.
    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    /// Set the retry ceiling.
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Whether the task recurs.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.schedule
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }

    /// Enabled, pending, and `next_run_at` is unset or not in the future.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && self.state == TaskState::Pending
            && self.next_run_at.is_none_or(|at| at <= now)
    }
}

/// Versioned, ordered list of tasks as stored in a task document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

fn default_version() -> u32 {
    TASK_LIST_VERSION
}

impl Default for TaskList {
    fn default() -> Self {
        Self {
            version: TASK_LIST_VERSION,
            tasks: Vec::new(),
        }
    }
}

impl TaskList {
    /// Create a list from tasks.
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            version: TASK_LIST_VERSION,
            tasks,
        }
    }

    /// Look up a task by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Look up a task by id for mutation.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Whether the list holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
