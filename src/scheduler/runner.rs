//! Scheduler loop: heartbeat timing and task dispatch.
//!
//! The scheduler owns no business logic. Everything it runs goes through
//! [`SchedulerCallbacks`]; it only decides *when* and keeps per-agent
//! backoff state, persisted after every heartbeat attempt so a restart
//! does not re-fire agents that just ran.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::schedule::AgentSchedule;
use super::state::SchedulerState;
use crate::bus::{EventBus, VigilEvent};
use crate::error::Result;
use crate::observability::SPAN_SCHEDULER_TICK;
use crate::tasks::{ExecutionMode, Task};

/// Default pause between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Why a heartbeat did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The agent's session lease is held elsewhere.
    Busy,
    /// No runner binding exists for the agent.
    Unconfigured,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => f.write_str("busy"),
            Self::Unconfigured => f.write_str("unconfigured"),
        }
    }
}

/// Result of one heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Nothing to do.
    Idle,
    /// A result was deposited for the user.
    Delivered,
    /// The agent acknowledged with nothing to report.
    Suppressed,
    /// Did not run; the heartbeat stays due.
    Skipped(SkipReason),
    Failed(String),
}

impl HeartbeatOutcome {
    /// Whether the attempt counts as a success for backoff.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Idle | Self::Delivered | Self::Suppressed)
    }
}

impl fmt::Display for HeartbeatOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Delivered => f.write_str("delivered"),
            Self::Suppressed => f.write_str("suppressed"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// A due task and the agent that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct DueTask {
    pub agent: String,
    pub task: Task,
}

/// Work the scheduler dispatches.
#[async_trait]
pub trait SchedulerCallbacks: Send + Sync {
    /// Run one heartbeat for `agent`.
    async fn run_heartbeat(&self, agent: &str, now: DateTime<Utc>) -> HeartbeatOutcome;

    /// Tasks due at `now` across all agents.
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<DueTask>>;

    /// Claim an isolated task exactly once. `false` if already claimed or no longer due.
    async fn claim_task(&self, agent: &str, task_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Run an agent's due inline tasks as one combined turn.
    async fn run_inline(&self, agent: &str, tasks: Vec<Task>, now: DateTime<Utc>) -> Result<()>;

    /// Run one claimed isolated task.
    async fn run_isolated(&self, agent: &str, task: Task, now: DateTime<Utc>) -> Result<()>;
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Heartbeat outcomes, in completion order.
    pub heartbeats: Vec<(String, HeartbeatOutcome)>,
    /// Inline batches dispatched (one per agent).
    pub inline_batches: usize,
    pub isolated_claimed: usize,
    /// Isolated tasks that could not be claimed.
    pub isolated_unclaimed: usize,
    /// Inline batches and isolated tasks that failed.
    pub task_failures: usize,
}

impl TickReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heartbeats.is_empty() && self.inline_batches == 0 && self.isolated_claimed == 0
    }
}

/// Drives heartbeats and task dispatch for every registered agent.
pub struct Scheduler {
    callbacks: Arc<dyn SchedulerCallbacks>,
    schedules: Mutex<BTreeMap<String, AgentSchedule>>,
    state_path: Option<PathBuf>,
    tick_interval: Duration,
    cancel: CancellationToken,
    bus: Option<EventBus>,
}

impl Scheduler {
    pub fn new(callbacks: Arc<dyn SchedulerCallbacks>) -> Self {
        Self {
            callbacks,
            schedules: Mutex::new(BTreeMap::new()),
            state_path: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            cancel: CancellationToken::new(),
            bus: None,
        }
    }

    /// Persist schedule state to `path` after every heartbeat attempt.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn lock_schedules(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, AgentSchedule>> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: VigilEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    /// Add or replace an agent's schedule.
    pub fn register_agent(&self, schedule: AgentSchedule) {
        info!(agent = %schedule.agent, interval_minutes = schedule.interval_minutes, "registered heartbeat schedule");
        self.lock_schedules().insert(schedule.agent.clone(), schedule);
    }

    /// Current schedule for `agent`.
    pub fn schedule(&self, agent: &str) -> Option<AgentSchedule> {
        self.lock_schedules().get(agent).cloned()
    }

    /// All schedules, ordered by agent name.
    pub fn schedules(&self) -> Vec<AgentSchedule> {
        self.lock_schedules().values().cloned().collect()
    }

    /// Restore persisted backoff state into registered schedules.
    ///
    /// Unreadable state is logged and ignored: every agent then fires on
    /// the first tick. Returns how many agents were restored.
    pub fn load_state(&self) -> usize {
        let Some(path) = &self.state_path else {
            return 0;
        };
        let state = match SchedulerState::load(path) {
            Ok(state) => state,
            Err(e) => {
                warn!("cannot load scheduler state, starting fresh: {e}");
                return 0;
            }
        };
        let mut schedules = self.lock_schedules();
        let restored = schedules
            .values_mut()
            .filter_map(|s| state.restore(s).then_some(()))
            .count();
        debug!(restored, "loaded scheduler state from {}", path.display());
        restored
    }

    fn save_state(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let state = {
            let schedules = self.lock_schedules();
            SchedulerState::capture(schedules.values())
        };
        if let Err(e) = state.save(path) {
            error!("cannot persist scheduler state: {e}");
        }
    }

    fn apply_outcome(&self, agent: &str, outcome: &HeartbeatOutcome, now: DateTime<Utc>) {
        let mut schedules = self.lock_schedules();
        let Some(schedule) = schedules.get_mut(agent) else {
            return;
        };
        match outcome {
            HeartbeatOutcome::Skipped(reason) => {
                debug!(agent, %reason, "heartbeat skipped; stays due");
            }
            outcome if outcome.is_success() => schedule.record_success(now),
            _ => {
                schedule.record_failure(now);
                warn!(
                    agent,
                    consecutive_failures = schedule.consecutive_failures,
                    next = ?schedule.next_heartbeat_at,
                    "heartbeat failed, backing off"
                );
            }
        }
    }

    async fn run_heartbeats(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let due: Vec<String> = self
            .lock_schedules()
            .values()
            .filter(|s| s.is_due(now))
            .map(|s| s.agent.clone())
            .collect();

        let mut running = JoinSet::new();
        for agent in due {
            self.publish(VigilEvent::HeartbeatStarted {
                agent: agent.clone(),
            });
            let callbacks = Arc::clone(&self.callbacks);
            running.spawn(async move {
                let outcome = AssertUnwindSafe(callbacks.run_heartbeat(&agent, now))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| HeartbeatOutcome::Failed("heartbeat panicked".to_owned()));
                (agent, outcome)
            });
        }

        while let Some(joined) = running.join_next().await {
            let (agent, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("heartbeat task aborted: {e}");
                    continue;
                }
            };
            info!(agent = %agent, %outcome, "heartbeat finished");
            self.apply_outcome(&agent, &outcome, now);
            self.save_state();
            self.publish(VigilEvent::HeartbeatFinished {
                agent: agent.clone(),
                outcome: outcome.to_string(),
            });
            report.heartbeats.push((agent, outcome));
        }
    }

    async fn run_tasks(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let due = match self.callbacks.due_tasks(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!("cannot collect due tasks: {e}");
                return;
            }
        };

        let mut inline: BTreeMap<String, Vec<Task>> = BTreeMap::new();
        let mut isolated = Vec::new();
        for DueTask { agent, task } in due {
            match task.execution_mode {
                ExecutionMode::Inline => inline.entry(agent).or_default().push(task),
                ExecutionMode::Isolated => isolated.push((agent, task)),
            }
        }

        let mut running = JoinSet::new();
        for (agent, tasks) in inline {
            report.inline_batches += 1;
            let callbacks = Arc::clone(&self.callbacks);
            let label = format!("inline batch for '{agent}' ({} tasks)", tasks.len());
            running.spawn(async move {
                let result = AssertUnwindSafe(callbacks.run_inline(&agent, tasks, now))
                    .catch_unwind()
                    .await;
                (label, result)
            });
        }

        for (agent, task) in isolated {
            match self.callbacks.claim_task(&agent, &task.id, now).await {
                Ok(true) => {
                    report.isolated_claimed += 1;
                    self.publish(VigilEvent::TaskClaimed {
                        agent: agent.clone(),
                        task_id: task.id.clone(),
                    });
                    let callbacks = Arc::clone(&self.callbacks);
                    let label = format!("isolated task '{}' for '{agent}'", task.id);
                    running.spawn(async move {
                        let result = AssertUnwindSafe(callbacks.run_isolated(&agent, task, now))
                            .catch_unwind()
                            .await;
                        (label, result)
                    });
                }
                Ok(false) => {
                    report.isolated_unclaimed += 1;
                    debug!(agent, task_id = %task.id, "task already claimed or no longer due");
                }
                Err(e) => {
                    report.isolated_unclaimed += 1;
                    warn!(agent, task_id = %task.id, "cannot claim task: {e}");
                }
            }
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => {}
                Ok((label, Ok(Err(e)))) => {
                    report.task_failures += 1;
                    error!("{label} failed: {e}");
                }
                Ok((label, Err(_))) => {
                    report.task_failures += 1;
                    error!("{label} panicked");
                }
                Err(e) => {
                    report.task_failures += 1;
                    error!("task dispatch aborted: {e}");
                }
            }
        }
    }

    /// Run one scheduling pass at `now`: heartbeats first, then due tasks.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let span = tracing::info_span!(SPAN_SCHEDULER_TICK, %now);
        async {
            let mut report = TickReport::default();
            self.run_heartbeats(now, &mut report).await;
            self.run_tasks(now, &mut report).await;
            if !report.is_empty() {
                debug!(?report, "tick complete");
            }
            report
        }
        .instrument(span)
        .await
    }

    /// Tick until [`stop`](Self::stop) is called.
    pub async fn run_forever(self: Arc<Self>) {
        info!(agents = self.lock_schedules().len(), "scheduler started");
        while !self.cancel.is_cancelled() {
            self.tick(Utc::now()).await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick_interval) => {}
            }
        }
        info!("scheduler stopped");
    }

    /// Spawn [`run_forever`](Self::run_forever) on the runtime.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run_forever())
    }

    /// Ask the loop to stop at the next iteration boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
