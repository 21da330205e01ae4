//! Heartbeat runner: the glue between the scheduler, task documents,
//! session store and turn orchestrator.
//!
//! One heartbeat for an agent:
//!
//! 1. take the primary-session lease (busy → skip, retried next tick)
//! 2. load the task document, heal stuck tasks and purge finished ones
//! 3. classify the tick and run the matching turn(s)
//! 4. suppress acknowledgement-only answers, deposit the rest into the
//!    primary mailbox and publish a notification
//!
//! Isolated tasks are claimed under the primary lease but run in fresh job
//! sessions after it is released, so a long job never blocks the user.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::classify::{TickKind, classify_tick, reflection_due};
use super::delivery::{DEFAULT_ACK_MAX_REMAINDER, DEFAULT_ACK_TOKEN, Delivery, decide};
use super::prompt;
use crate::agent::{AgentProvider, AgentSnapshot, TurnRequest};
use crate::bus::{EventBus, VigilEvent};
use crate::capability::CapabilityRegistry;
use crate::error::{Result, VigilError};
use crate::observability::{
    FIELD_AGENT, FIELD_SESSION_ID, FIELD_TASK_ID, SPAN_HEARTBEAT_RUN, SPAN_TURN,
};
use crate::orchestrator::{TurnOrchestrator, TurnOutcome, TurnPolicy};
use crate::scheduler::{DueTask, HeartbeatOutcome, SchedulerCallbacks, SkipReason};
use crate::session::{
    ContextTrace, EventPriority, FsSessionStore, HistoryMessage, Mailbox, MessageRole, SessionKey,
    SessionLease, SystemEvent, TimelineEntry,
};
use crate::session::mailbox::drain_from;
use crate::tasks::{
    DEFAULT_PURGE_AFTER_DAYS, ParseOutcome, Task, TaskDocument, TaskList, TaskState,
    TaskTransition, claim_in, get_due_tasks, heal_stuck_tasks, purge_stale_tasks,
    update_task_state,
};

/// Primary-session variable holding the time of the last task-list review.
pub const LAST_REFLECTION_VAR: &str = "vigil.last_reflection_at";

/// `[heartbeat]` configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Answer meaning "nothing to report".
    pub ack_token: String,
    /// Remainder length around the token at which the answer counts as a report.
    pub ack_max_remainder_chars: usize,
    /// How long a heartbeat waits for the primary session before skipping.
    pub lease_timeout_ms: u64,
    /// How long a finished job waits for the primary session to record
    /// its result.
    pub result_lease_timeout_ms: u64,
    /// Minutes between task-list reviews when nothing is due. `0` disables.
    pub reflect_every_minutes: u32,
    /// Publish bus notifications for delivered results.
    pub notify: bool,
    /// Days finished one-shot tasks are kept.
    pub purge_after_days: i64,
    /// Messages of history kept per session.
    pub history_limit: usize,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            ack_token: DEFAULT_ACK_TOKEN.to_owned(),
            ack_max_remainder_chars: DEFAULT_ACK_MAX_REMAINDER,
            lease_timeout_ms: 2_000,
            result_lease_timeout_ms: 30_000,
            reflect_every_minutes: 0,
            notify: true,
            purge_after_days: DEFAULT_PURGE_AFTER_DAYS,
            history_limit: 200,
        }
    }
}

impl HeartbeatSettings {
    pub fn lease_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.lease_timeout_ms)
    }

    pub fn result_lease_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.result_lease_timeout_ms)
    }

    pub fn reflect_every(&self) -> Duration {
        Duration::minutes(i64::from(self.reflect_every_minutes))
    }

    /// Retention for finished one-shot tasks; out-of-range values mean
    /// "keep forever".
    pub fn purge_after(&self) -> Duration {
        Duration::try_days(self.purge_after_days.max(0)).unwrap_or(Duration::MAX)
    }
}

/// Everything the runner needs to drive one agent.
pub struct AgentBinding {
    name: String,
    provider: Arc<dyn AgentProvider>,
    document: TaskDocument,
    system_prompt: Option<String>,
    capabilities: CapabilityRegistry,
}

impl AgentBinding {
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn AgentProvider>,
        document: TaskDocument,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            document,
            system_prompt: None,
            capabilities: CapabilityRegistry::new(),
        }
    }

    /// System prompt override applied to every heartbeat and task turn.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilityRegistry) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &TaskDocument {
        &self.document
    }
}

impl std::fmt::Debug for AgentBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBinding")
            .field("name", &self.name)
            .field("document", &self.document.path())
            .field("system_prompt", &self.system_prompt.is_some())
            .finish_non_exhaustive()
    }
}

/// What a turn ran for; recorded in the session's context trace.
struct TurnContext<'a> {
    trigger: String,
    task_ids: Vec<String>,
    timeout_secs: Option<u64>,
    key: &'a SessionKey,
    lease: &'a SessionLease,
}

/// Tally of the turns run by one heartbeat.
#[derive(Debug, Default)]
struct RunSummary {
    turns: usize,
    delivered: bool,
    errors: Vec<String>,
}

impl RunSummary {
    fn record_turn(&mut self, outcome: &Result<TurnOutcome>) {
        self.turns += 1;
        match outcome {
            Ok(TurnOutcome::Completed { .. }) => {}
            Ok(failed) => self.errors.push(failed.error_text().unwrap_or_default()),
            Err(e) => self.errors.push(e.to_string()),
        }
    }

    fn into_outcome(self) -> HeartbeatOutcome {
        if self.turns > 0 && self.errors.len() >= self.turns && !self.delivered {
            HeartbeatOutcome::Failed(self.errors.join("; "))
        } else if self.delivered {
            HeartbeatOutcome::Delivered
        } else if self.turns == 0 {
            HeartbeatOutcome::Idle
        } else {
            HeartbeatOutcome::Suppressed
        }
    }
}

/// Drives heartbeats and task runs for registered agents.
pub struct HeartbeatRunner {
    agents: BTreeMap<String, AgentBinding>,
    store: Arc<FsSessionStore>,
    mailbox: Mailbox,
    policy: TurnPolicy,
    settings: HeartbeatSettings,
    bus: Option<EventBus>,
    cancel: CancellationToken,
}

impl HeartbeatRunner {
    pub fn new(store: Arc<FsSessionStore>, policy: TurnPolicy, settings: HeartbeatSettings) -> Self {
        Self {
            agents: BTreeMap::new(),
            mailbox: Mailbox::new(Arc::clone(&store)),
            store,
            policy,
            settings,
            bus: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the mailbox, e.g. to change its staleness window. It must
    /// share this runner's store.
    pub fn with_mailbox(mut self, mailbox: Mailbox) -> Self {
        self.mailbox = mailbox;
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Cancelling `cancel` aborts in-flight turns.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn register(&mut self, binding: AgentBinding) {
        self.agents.insert(binding.name.clone(), binding);
    }

    pub fn with_agent(mut self, binding: AgentBinding) -> Self {
        self.register(binding);
        self
    }

    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.settings
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn publish(&self, event: VigilEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    fn binding(&self, agent: &str) -> Result<&AgentBinding> {
        self.agents
            .get(agent)
            .ok_or_else(|| VigilError::Agent(format!("unknown agent '{agent}'")))
    }

    // ── heartbeat ──────────────────────────────────────────────────────

    async fn heartbeat(&self, agent: &str, now: DateTime<Utc>) -> Result<HeartbeatOutcome> {
        let Some(binding) = self.agents.get(agent) else {
            return Ok(HeartbeatOutcome::Skipped(SkipReason::Unconfigured));
        };
        let primary = SessionKey::primary(agent);
        let Some(lease) = self.store.lease(&primary.id, self.settings.lease_timeout()).await? else {
            info!("primary session busy, heartbeat skipped");
            return Ok(HeartbeatOutcome::Skipped(SkipReason::Busy));
        };

        let document = self.prepare_document(binding, now)?;
        let last_reflection = self
            .store
            .load_with_lease(&lease)
            .and_then(|record| record.variables.get(LAST_REFLECTION_VAR).cloned())
            .and_then(|value| serde_json::from_value::<DateTime<Utc>>(value).ok());
        let reflect = reflection_due(last_reflection, now, self.settings.reflect_every());
        let kind = classify_tick(&document, now, reflect);
        debug!(kind = kind.label(), "heartbeat classified");

        let mut summary = RunSummary::default();
        let mut isolated_claimed = Vec::new();
        match &kind {
            TickKind::Idle => return Ok(HeartbeatOutcome::Idle),
            TickKind::Corrupted { reason } => {
                self.repair_document(binding, &lease, &primary, reason, now, &mut summary)
                    .await?;
            }
            TickKind::StructuredReflect => {
                let list = match &document {
                    ParseOutcome::Ok(list) => list.clone(),
                    ParseOutcome::Empty | ParseOutcome::Corrupted { .. } => TaskList::default(),
                };
                self.reflect(binding, &lease, &primary, &list, now, &mut summary)
                    .await?;
            }
            TickKind::StructuredDue { inline, isolated } => {
                if !inline.is_empty() {
                    self.execute_inline(binding, &lease, &primary, inline, now, &mut summary)
                        .await?;
                }
                for task in isolated {
                    if let Some(claimed) = self.claim(binding, &task.id, now)? {
                        self.publish(VigilEvent::TaskClaimed {
                            agent: binding.name.clone(),
                            task_id: task.id.clone(),
                        });
                        isolated_claimed.push(claimed);
                    }
                }
            }
        }

        if summary.turns > 0 {
            let cap = self.store.timeline_cap();
            let label = kind.label();
            self.store.mutate_with_lease(&lease, &primary, |record| {
                record.push_timeline(TimelineEntry::new(now, "heartbeat", label), cap);
            })?;
        }
        drop(lease);

        for task in isolated_claimed {
            summary.turns += 1;
            match self.execute_isolated(binding, &task, now).await {
                Ok(delivered) => summary.delivered |= delivered,
                Err(e) => summary.errors.push(e.to_string()),
            }
        }

        Ok(summary.into_outcome())
    }

    /// Load the document, repairing and purging a valid task list in place.
    fn prepare_document(&self, binding: &AgentBinding, now: DateTime<Utc>) -> Result<ParseOutcome> {
        let mut outcome = binding.document.load()?;
        if let ParseOutcome::Ok(list) = &mut outcome {
            let healed = heal_stuck_tasks(list, now, binding.document.engine(), |task| {
                let attempt_timeout = StdDuration::from_secs(task.timeout_seconds.max(1));
                Duration::from_std(self.policy.max_turn_duration(attempt_timeout))
                    .unwrap_or(Duration::MAX)
            });
            let purged = purge_stale_tasks(list, now, self.settings.purge_after());
            if healed > 0 {
                warn!(healed, "released or re-armed stuck tasks");
            }
            if purged > 0 {
                debug!(purged, "purged finished tasks");
            }
            if healed + purged > 0 {
                binding.document.save(list)?;
            }
        }
        Ok(outcome)
    }

    async fn repair_document(
        &self,
        binding: &AgentBinding,
        lease: &SessionLease,
        primary: &SessionKey,
        reason: &str,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        warn!(reason, "task document is corrupted");
        let digest = Sha256::digest(reason.as_bytes());
        let fingerprint: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
        let diagnostic = SystemEvent::new(
            "diagnostic",
            primary.id.clone(),
            format!("Task document {} cannot be parsed", binding.document.path().display()),
            now,
        )
        .with_event_id(format!("diagnostic:{}:{fingerprint}", binding.name))
        .with_detail(reason)
        .with_priority(EventPriority::High)
        .with_dedupe_key(format!("diagnostic:{}:task_document", binding.name));
        if self.deposit(lease, primary, &binding.name, diagnostic)? {
            summary.delivered = true;
        }

        let path = binding.document.path().display().to_string();
        let prompt = prompt::corrupted_document_prompt(&path, reason, &self.settings.ack_token);
        let outcome = self
            .run_turn(
                binding,
                TurnContext {
                    trigger: "heartbeat:corrupted".to_owned(),
                    task_ids: Vec::new(),
                    timeout_secs: None,
                    key: primary,
                    lease,
                },
                prompt,
                now,
            )
            .await;
        summary.record_turn(&outcome);
        if let Ok(TurnOutcome::Completed { answer, .. }) = outcome
            && self.deliver(lease, primary, binding, &answer, &primary.id, None, now)?
        {
            summary.delivered = true;
        }
        Ok(())
    }

    async fn reflect(
        &self,
        binding: &AgentBinding,
        lease: &SessionLease,
        primary: &SessionKey,
        list: &TaskList,
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let prompt = prompt::reflection_prompt(
            list,
            &binding.capabilities.render(),
            &self.settings.ack_token,
        );
        let outcome = self
            .run_turn(
                binding,
                TurnContext {
                    trigger: "heartbeat:structured_reflect".to_owned(),
                    task_ids: Vec::new(),
                    timeout_secs: None,
                    key: primary,
                    lease,
                },
                prompt,
                now,
            )
            .await;
        summary.record_turn(&outcome);

        // A failed review still counts; otherwise a broken agent is asked
        // to review on every tick.
        let stamp = serde_json::to_value(now)?;
        self.store.mutate_with_lease(lease, primary, |record| {
            record.variables.insert(LAST_REFLECTION_VAR.to_owned(), stamp);
        })?;

        if let Ok(TurnOutcome::Completed { answer, .. }) = outcome
            && self.deliver(lease, primary, binding, &answer, &primary.id, None, now)?
        {
            summary.delivered = true;
        }
        Ok(())
    }

    // ── tasks ──────────────────────────────────────────────────────────

    /// Claim one task in the document and return the claimed copy, which
    /// carries the run token. `None` when it is no longer due.
    ///
    /// Callers publish [`VigilEvent::TaskClaimed`]; the scheduler does so
    /// for claims made through [`SchedulerCallbacks::claim_task`].
    fn claim(
        &self,
        binding: &AgentBinding,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let claimed = binding
            .document
            .update(|list| {
                if claim_in(list, task_id, now) {
                    list.get(task_id).cloned()
                } else {
                    None
                }
            })?
            .flatten();
        if claimed.is_none() {
            debug!(task_id, "task no longer due, not claimed");
        }
        Ok(claimed)
    }

    /// The current running copy of `task_id`, as claimed through
    /// [`SchedulerCallbacks::claim_task`].
    fn claimed_copy(&self, binding: &AgentBinding, task_id: &str) -> Result<Task> {
        let ParseOutcome::Ok(list) = binding.document.load()? else {
            return Err(VigilError::TaskDocument(format!(
                "task document for '{}' unusable, task '{task_id}' not run",
                binding.name
            )));
        };
        list.get(task_id)
            .filter(|task| task.state == TaskState::Running && task.run_id.is_some())
            .cloned()
            .ok_or_else(|| {
                VigilError::InvalidTransition(format!("task '{task_id}' is not claimed, not run"))
            })
    }

    /// Claim `tasks` and run them as one turn on the primary session.
    async fn execute_inline(
        &self,
        binding: &AgentBinding,
        lease: &SessionLease,
        primary: &SessionKey,
        tasks: &[Task],
        now: DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let claimed: Vec<Task> = binding
            .document
            .update(|list| {
                let mut claimed = Vec::new();
                for task in tasks {
                    if claim_in(list, &task.id, now)
                        && let Some(current) = list.get(&task.id)
                    {
                        claimed.push(current.clone());
                    }
                }
                claimed
            })?
            .unwrap_or_default();
        if claimed.is_empty() {
            return Ok(());
        }
        for task in &claimed {
            self.publish(VigilEvent::TaskClaimed {
                agent: binding.name.clone(),
                task_id: task.id.clone(),
            });
        }

        let drained = self
            .store
            .load_with_lease(lease)
            .map(|mut record| drain_from(&mut record, now, self.mailbox.staleness()))
            .unwrap_or_default();
        let prompt =
            prompt::inline_tasks_prompt(&claimed, &drained.render(), &self.settings.ack_token);
        let outcome = self
            .run_turn(
                binding,
                TurnContext {
                    trigger: "heartbeat:structured_due".to_owned(),
                    task_ids: claimed.iter().map(|t| t.id.clone()).collect(),
                    timeout_secs: claimed.iter().map(|t| t.timeout_seconds).max(),
                    key: primary,
                    lease,
                },
                prompt,
                now,
            )
            .await;
        summary.record_turn(&outcome);

        match outcome {
            Ok(TurnOutcome::Completed { answer, .. }) => {
                for task in &claimed {
                    self.finish_task(binding, lease, primary, task, Ok(()), now)?;
                }
                // The agent has seen them; later turns must not repeat them.
                if !drained.ack_ids.is_empty() {
                    let acked = self.mailbox.ack_with_lease(lease, primary, &drained.ack_ids)?;
                    debug!(acked, "mailbox events handed to the agent acknowledged");
                }
                if self.deliver(lease, primary, binding, &answer, &primary.id, None, now)? {
                    summary.delivered = true;
                }
            }
            Ok(failed) => {
                let error = failed.error_text().unwrap_or_default();
                for task in &claimed {
                    self.finish_task(binding, lease, primary, task, Err(error.clone()), now)?;
                }
            }
            Err(e) => {
                let error = e.to_string();
                for task in &claimed {
                    self.finish_task(binding, lease, primary, task, Err(error.clone()), now)?;
                }
            }
        }
        Ok(())
    }

    /// Run an already-claimed task in a fresh job session, then record the
    /// result under the primary lease. Returns whether a report was delivered.
    async fn execute_isolated(
        &self,
        binding: &AgentBinding,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let job = SessionKey::job(&binding.name);
        let result = self.run_job(binding, &job, task, now).await;

        let primary = SessionKey::primary(&binding.name);
        let Some(lease) = self
            .store
            .lease(&primary.id, self.settings.result_lease_timeout())
            .await?
        else {
            // The task stays running; heal_stuck_tasks releases it later.
            return Err(VigilError::Lock(format!(
                "primary session {} busy, result of task '{}' not recorded",
                primary.id, task.id
            )));
        };

        match result {
            Ok(answer) => {
                self.finish_task(binding, &lease, &primary, task, Ok(()), now)?;
                self.deliver(&lease, &primary, binding, &answer, &job.id, Some(&task.id), now)
            }
            Err(error) => {
                self.finish_task(binding, &lease, &primary, task, Err(error.clone()), now)?;
                Err(VigilError::Agent(error))
            }
        }
    }

    /// One turn in a job session. `Err` carries the failure text.
    async fn run_job(
        &self,
        binding: &AgentBinding,
        job: &SessionKey,
        task: &Task,
        now: DateTime<Utc>,
    ) -> std::result::Result<String, String> {
        let span = info_span!("task_job", { FIELD_TASK_ID } = %task.id, { FIELD_SESSION_ID } = %job.id);
        async {
            let lease = match self.store.lease(&job.id, self.settings.lease_timeout()).await {
                Ok(Some(lease)) => lease,
                Ok(None) => return Err(format!("job session {} busy", job.id)),
                Err(e) => return Err(e.to_string()),
            };
            let prompt = prompt::isolated_task_prompt(task, &self.settings.ack_token);
            let outcome = self
                .run_turn(
                    binding,
                    TurnContext {
                        trigger: format!("task:{}", task.id),
                        task_ids: vec![task.id.clone()],
                        timeout_secs: Some(task.timeout_seconds),
                        key: job,
                        lease: &lease,
                    },
                    prompt,
                    now,
                )
                .await;
            match outcome {
                Ok(TurnOutcome::Completed { answer, .. }) => Ok(answer),
                Ok(failed) => Err(failed.error_text().unwrap_or_default()),
                Err(e) => Err(e.to_string()),
            }
        }
        .instrument(span)
        .await
    }

    /// Apply the run result to the task and report terminal failures.
    fn finish_task(
        &self,
        binding: &AgentBinding,
        lease: &SessionLease,
        primary: &SessionKey,
        task: &Task,
        result: std::result::Result<(), String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let transition = match &result {
            Ok(()) => TaskTransition::Succeed,
            Err(error) => TaskTransition::Fail(error.clone()),
        };
        let engine = binding.document.engine();
        let updated = binding.document.update(|list: &mut TaskList| -> Result<Option<Task>> {
            let Some(current) = list.get_mut(&task.id) else {
                return Ok(None);
            };
            if current.state != TaskState::Running || current.run_id != task.run_id {
                return Err(VigilError::InvalidTransition(format!(
                    "run {} of task '{}' was superseded",
                    task.run_id.as_deref().unwrap_or("-"),
                    task.id
                )));
            }
            update_task_state(current, transition, now, engine)?;
            Ok(Some(current.clone()))
        })?;
        let updated = match updated {
            Some(Ok(updated)) => updated,
            Some(Err(e)) => {
                warn!(task_id = %task.id, "cannot record task result: {e}");
                None
            }
            None => {
                warn!(task_id = %task.id, "task document unusable, result not recorded");
                None
            }
        };

        self.publish(VigilEvent::TaskFinished {
            agent: binding.name.clone(),
            task_id: task.id.clone(),
            succeeded: result.is_ok(),
        });

        if let Err(error) = &result {
            warn!(task_id = %task.id, "task run failed: {error}");
            if let Some(updated) = updated
                && updated.state == TaskState::Failed
            {
                let event = SystemEvent::new(
                    "task_failed",
                    primary.id.clone(),
                    format!("Task '{}' failed after {} attempts", updated.title, updated.max_retry),
                    now,
                )
                .with_detail(error.clone())
                .with_priority(EventPriority::High)
                .with_dedupe_key(format!("task:{}:{}", binding.name, updated.id));
                self.deposit(lease, primary, &binding.name, event)?;
            }
        }
        Ok(())
    }

    // ── delivery ───────────────────────────────────────────────────────

    /// Deposit `answer` unless it is an acknowledgement. Returns whether
    /// the mailbox accepted it.
    ///
    /// Task results carry a per-task dedupe key; heartbeat reports share
    /// one per agent so only the latest survives.
    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &self,
        lease: &SessionLease,
        primary: &SessionKey,
        binding: &AgentBinding,
        answer: &str,
        source_session_id: &str,
        task_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match decide(answer, &self.settings.ack_token, self.settings.ack_max_remainder_chars) {
            Delivery::Suppress => {
                debug!("acknowledgement suppressed");
                Ok(false)
            }
            Delivery::Deliver { summary, detail } => {
                let (event_type, dedupe) = match task_id {
                    Some(id) => ("task_result", format!("task:{}:{id}", binding.name)),
                    None => ("heartbeat", format!("heartbeat:{}", binding.name)),
                };
                let event = SystemEvent::new(event_type, source_session_id, summary, now)
                    .with_detail(detail)
                    .with_dedupe_key(dedupe)
                    .suppress_if_stale();
                self.deposit(lease, primary, &binding.name, event)
            }
        }
    }

    fn deposit(
        &self,
        lease: &SessionLease,
        primary: &SessionKey,
        agent: &str,
        event: SystemEvent,
    ) -> Result<bool> {
        let event_id = event.event_id.clone();
        let summary = event.summary.clone();
        let priority = event.priority;
        let accepted = self.mailbox.deposit_with_lease(lease, primary, event)?;
        if accepted {
            self.publish(VigilEvent::MailboxDeposited {
                session_id: primary.id.clone(),
                event_id,
            });
            if self.settings.notify {
                self.publish(VigilEvent::Notification {
                    agent: agent.to_owned(),
                    summary,
                    priority,
                });
            }
        }
        Ok(accepted)
    }

    // ── turns ──────────────────────────────────────────────────────────

    /// Run one orchestrated turn in `ctx.key` and persist its effects.
    async fn run_turn(
        &self,
        binding: &AgentBinding,
        ctx: TurnContext<'_>,
        prompt: String,
        now: DateTime<Utc>,
    ) -> Result<TurnOutcome> {
        let span = info_span!(SPAN_TURN, { FIELD_SESSION_ID } = %ctx.key.id, trigger = %ctx.trigger);
        async {
            let runtime = binding
                .provider
                .open(ctx.key)
                .await
                .map_err(|e| VigilError::Agent(e.message))?;
            if let Some(record) = self.store.load_with_lease(ctx.lease) {
                runtime
                    .import_state(AgentSnapshot {
                        history: record.history_messages,
                        variables: record.variables,
                    })
                    .await
                    .map_err(|e| VigilError::Agent(e.message))?;
            }

            let mut policy = self
                .policy
                .clone()
                .with_exempt_tools(binding.capabilities.exempt_names());
            if let Some(secs) = ctx.timeout_secs {
                policy = policy.with_timeout_secs(secs);
            }
            let mut request = TurnRequest::new(prompt.clone());
            if let Some(system_prompt) = &binding.system_prompt {
                request = request.with_system_prompt(system_prompt.clone());
            }

            let orchestrator = TurnOrchestrator::new(Arc::clone(&runtime), policy)
                .with_cancel_token(self.cancel.child_token());
            let outcome = orchestrator
                .run_to_outcome(request, |event| {
                    self.publish(VigilEvent::Turn {
                        session_id: ctx.key.id.clone(),
                        event: event.clone(),
                    });
                })
                .await;

            let snapshot = runtime.export_state().await.unwrap_or_else(|e| {
                warn!("cannot export agent state: {e}");
                AgentSnapshot::default()
            });
            self.persist_turn(&ctx, snapshot, prompt, &outcome, binding.system_prompt.is_some(), now)?;

            match &outcome {
                TurnOutcome::Completed { counters, .. } => {
                    info!(tool_calls = counters.tool_call_count, "turn completed");
                }
                TurnOutcome::Failed { .. } => {
                    warn!(error = ?outcome.error_text(), "turn failed");
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    fn persist_turn(
        &self,
        ctx: &TurnContext<'_>,
        snapshot: AgentSnapshot,
        prompt: String,
        outcome: &TurnOutcome,
        system_prompt_override: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cap = self.store.timeline_cap();
        let history_limit = self.settings.history_limit;
        let prompt_chars = prompt.chars().count();
        let detail = match outcome {
            TurnOutcome::Completed { counters, .. } => {
                format!("completed after {} tool calls", counters.tool_call_count)
            }
            TurnOutcome::Failed { .. } => outcome.error_text().unwrap_or_default(),
        };
        let trace = ContextTrace {
            recorded_at: Some(now),
            trigger: ctx.trigger.clone(),
            task_ids: ctx.task_ids.clone(),
            prompt_chars,
            system_prompt_override,
        };

        self.store.mutate_with_lease(ctx.lease, ctx.key, |record| {
            if snapshot.history.is_empty() {
                record
                    .history_messages
                    .push(HistoryMessage::new(MessageRole::User, prompt, now));
                if let Some(answer) = outcome.answer() {
                    record
                        .history_messages
                        .push(HistoryMessage::new(MessageRole::Assistant, answer, now));
                }
            } else {
                record.history_messages = snapshot.history;
            }
            if record.history_messages.len() > history_limit {
                let excess = record.history_messages.len() - history_limit;
                record.history_messages.drain(..excess);
            }
            record.variables.extend(snapshot.variables);
            record.push_timeline(TimelineEntry::new(now, format!("turn:{}", ctx.trigger), detail), cap);
            record.context_trace = Some(trace);
        })
    }
}

impl std::fmt::Debug for HeartbeatRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatRunner")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SchedulerCallbacks for HeartbeatRunner {
    async fn run_heartbeat(&self, agent: &str, now: DateTime<Utc>) -> HeartbeatOutcome {
        let span = info_span!(SPAN_HEARTBEAT_RUN, { FIELD_AGENT } = agent);
        self.heartbeat(agent, now)
            .instrument(span)
            .await
            .unwrap_or_else(|e| HeartbeatOutcome::Failed(e.to_string()))
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<DueTask>> {
        let mut due = Vec::new();
        for (agent, binding) in &self.agents {
            match binding.document.load() {
                Ok(ParseOutcome::Ok(list)) => {
                    due.extend(get_due_tasks(&list, now).into_iter().map(|task| DueTask {
                        agent: agent.clone(),
                        task: task.clone(),
                    }));
                }
                // The next heartbeat reports corruption.
                Ok(ParseOutcome::Empty | ParseOutcome::Corrupted { .. }) => {}
                Err(e) => warn!(agent = %agent, "cannot read task document: {e}"),
            }
        }
        Ok(due)
    }

    async fn claim_task(&self, agent: &str, task_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let binding = self.binding(agent)?;
        let primary = SessionKey::primary(agent);
        let Some(_lease) = self.store.lease(&primary.id, self.settings.lease_timeout()).await? else {
            debug!(agent, task_id, "primary session busy, claim deferred");
            return Ok(false);
        };
        Ok(self.claim(binding, task_id, now)?.is_some())
    }

    async fn run_inline(&self, agent: &str, tasks: Vec<Task>, now: DateTime<Utc>) -> Result<()> {
        let binding = self.binding(agent)?;
        let primary = SessionKey::primary(agent);
        let Some(lease) = self.store.lease(&primary.id, self.settings.lease_timeout()).await? else {
            debug!(agent, "primary session busy, inline tasks deferred");
            return Ok(());
        };
        let mut summary = RunSummary::default();
        let span = info_span!(SPAN_HEARTBEAT_RUN, { FIELD_AGENT } = agent, pass = "tasks");
        self.execute_inline(binding, &lease, &primary, &tasks, now, &mut summary)
            .instrument(span)
            .await?;
        if summary.errors.is_empty() {
            Ok(())
        } else {
            Err(VigilError::Agent(summary.errors.join("; ")))
        }
    }

    async fn run_isolated(&self, agent: &str, task: Task, now: DateTime<Utc>) -> Result<()> {
        let binding = self.binding(agent)?;
        // The scheduler hands over the unclaimed copy; run under the claim.
        let task = self.claimed_copy(binding, &task.id)?;
        self.execute_isolated(binding, &task, now).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::sync::Mutex;

    use super::*;
    use crate::agent::{AgentError, AgentEvent, AgentEventStream, AgentRuntime};
    use crate::tasks::{ExecutionMode, ScheduleEngine};

    /// Answers every turn with the next scripted reply (last one repeats).
    struct ReplyAgent {
        replies: Vec<std::result::Result<String, String>>,
        calls: Mutex<Vec<TurnRequest>>,
        sessions: Mutex<Vec<String>>,
    }

    impl ReplyAgent {
        fn new(replies: Vec<std::result::Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                replies: replies
                    .into_iter()
                    .map(|r| r.map(str::to_owned).map_err(str::to_owned))
                    .collect(),
                calls: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|r| r.message.clone()).collect()
        }
    }

    #[async_trait]
    impl AgentRuntime for ReplyAgent {
        async fn run_turn(
            &self,
            request: &TurnRequest,
        ) -> std::result::Result<AgentEventStream, AgentError> {
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(request.clone());
                calls.len() - 1
            };
            let reply = self.replies[index.min(self.replies.len() - 1)].clone();
            let item = match reply {
                Ok(text) => Ok(AgentEvent::Llm { text }),
                Err(message) => Err(AgentError::new(message)),
            };
            Ok(Box::pin(futures_util::stream::iter(vec![item])))
        }

        async fn export_state(&self) -> std::result::Result<AgentSnapshot, AgentError> {
            Ok(AgentSnapshot::default())
        }

        async fn import_state(&self, _: AgentSnapshot) -> std::result::Result<(), AgentError> {
            Ok(())
        }
    }

    /// Provider that hands out one shared runtime so calls can be counted.
    struct Shared(Arc<ReplyAgent>);

    #[async_trait]
    impl AgentProvider for Shared {
        async fn open(
            &self,
            session: &SessionKey,
        ) -> std::result::Result<Arc<dyn AgentRuntime>, AgentError> {
            self.0.sessions.lock().unwrap().push(session.id.clone());
            Ok(Arc::clone(&self.0) as Arc<dyn AgentRuntime>)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<FsSessionStore>,
        document: std::path::PathBuf,
        agent: Arc<ReplyAgent>,
        runner: HeartbeatRunner,
    }

    fn fixture(replies: Vec<std::result::Result<&str, &str>>, tasks: Option<Vec<Task>>) -> Fixture {
        fixture_with(replies, tasks, HeartbeatSettings::default())
    }

    fn fixture_with(
        replies: Vec<std::result::Result<&str, &str>>,
        tasks: Option<Vec<Task>>,
        settings: HeartbeatSettings,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsSessionStore::new(dir.path().join("sessions")).unwrap());
        let document = dir.path().join("HEARTBEAT.md");
        let task_doc = TaskDocument::new(&document, ScheduleEngine::interval_only());
        std::fs::write(&document, "Operations checklist.\n").unwrap();
        if let Some(tasks) = tasks {
            task_doc.save(&TaskList::new(tasks)).unwrap();
        }
        let agent = ReplyAgent::new(replies);
        let policy = TurnPolicy {
            max_attempts: 1,
            ..TurnPolicy::default()
        };
        let runner = HeartbeatRunner::new(Arc::clone(&store), policy, settings).with_agent(
            AgentBinding::new("ops", Arc::new(Shared(Arc::clone(&agent))), task_doc),
        );
        Fixture {
            _dir: dir,
            store,
            document,
            agent,
            runner,
        }
    }

    fn load_tasks(path: &std::path::Path) -> TaskList {
        match TaskDocument::new(path, ScheduleEngine::interval_only()).load().unwrap() {
            ParseOutcome::Ok(list) => list,
            other => panic!("expected task list, got {other:?}"),
        }
    }

    async fn primary_record(store: &FsSessionStore) -> crate::session::SessionRecord {
        store
            .load("ops.primary")
            .await
            .unwrap()
            .acquired()
            .flatten()
            .expect("primary session exists")
    }

    #[tokio::test]
    async fn document_without_task_block_is_idle_and_silent() {
        let f = fixture(vec![Ok("unused")], None);
        let outcome = f.runner.run_heartbeat("ops", Utc::now()).await;
        assert_eq!(outcome, HeartbeatOutcome::Idle);
        assert!(f.agent.prompts().is_empty());
        assert!(!f.store.exists("ops.primary"));
    }

    #[tokio::test]
    async fn unknown_agent_is_skipped() {
        let f = fixture(vec![Ok("unused")], None);
        let outcome = f.runner.run_heartbeat("nobody", Utc::now()).await;
        assert_eq!(outcome, HeartbeatOutcome::Skipped(SkipReason::Unconfigured));
    }

    #[tokio::test]
    async fn acknowledgement_is_suppressed_and_task_rearmed() {
        let now = Utc::now();
        let task = Task::new("disk", "Check disk space").with_schedule("1h");
        let f = fixture(vec![Ok("HEARTBEAT_OK")], Some(vec![task]));

        let outcome = f.runner.run_heartbeat("ops", now).await;
        assert_eq!(outcome, HeartbeatOutcome::Suppressed);

        let prompts = f.agent.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("[disk] Check disk space"));

        let list = load_tasks(&f.document);
        let disk = list.get("disk").unwrap();
        assert_eq!(disk.state, TaskState::Pending);
        assert_eq!(disk.next_run_at, Some(now + Duration::hours(1)));

        let record = primary_record(&f.store).await;
        assert!(record.mailbox.is_empty());
        let trace = record.context_trace.unwrap();
        assert_eq!(trace.trigger, "heartbeat:structured_due");
        assert_eq!(trace.task_ids, vec!["disk"]);
        assert_eq!(record.history_messages.len(), 2);
    }

    #[tokio::test]
    async fn report_is_deposited_and_notified() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let task = Task::new("disk", "Check disk space");
        let mut f = fixture(vec![Ok("Disk /var is 97% full.")], Some(vec![task]));
        f.runner = f.runner.with_bus(bus);

        let outcome = f.runner.run_heartbeat("ops", Utc::now()).await;
        assert_eq!(outcome, HeartbeatOutcome::Delivered);

        let record = primary_record(&f.store).await;
        assert_eq!(record.mailbox.len(), 1);
        assert_eq!(record.mailbox[0].summary, "Disk /var is 97% full.");
        assert_eq!(record.mailbox[0].dedupe_key.as_deref(), Some("heartbeat:ops"));

        let list = load_tasks(&f.document);
        assert_eq!(list.get("disk").unwrap().state, TaskState::Done);

        let mut saw_notification = false;
        while let Ok(event) = rx.try_recv() {
            if let VigilEvent::Notification { summary, .. } = event {
                assert_eq!(summary, "Disk /var is 97% full.");
                saw_notification = true;
            }
        }
        assert!(saw_notification);
    }

    #[tokio::test]
    async fn failed_turn_consumes_a_retry_and_fails_the_heartbeat() {
        let now = Utc::now();
        let task = Task::new("disk", "Check disk space").with_max_retry(3);
        let f = fixture(vec![Err("invalid api key")], Some(vec![task]));

        let outcome = f.runner.run_heartbeat("ops", now).await;
        assert!(matches!(outcome, HeartbeatOutcome::Failed(_)), "{outcome:?}");

        let disk = load_tasks(&f.document).get("disk").cloned().unwrap();
        assert_eq!(disk.state, TaskState::Pending);
        assert_eq!(disk.retry, 1);
        assert!(disk.next_run_at.unwrap() > now);
        assert!(disk.error_message.unwrap().contains("invalid api key"));
    }

    #[tokio::test]
    async fn exhausted_one_shot_task_reports_failure() {
        let task = Task::new("disk", "Check disk space").with_max_retry(1);
        let f = fixture(vec![Err("invalid api key")], Some(vec![task]));

        f.runner.run_heartbeat("ops", Utc::now()).await;

        let disk = load_tasks(&f.document).get("disk").cloned().unwrap();
        assert_eq!(disk.state, TaskState::Failed);
        let record = primary_record(&f.store).await;
        assert_eq!(record.mailbox.len(), 1);
        assert_eq!(record.mailbox[0].event_type, "task_failed");
        assert_eq!(record.mailbox[0].priority, EventPriority::High);
    }

    #[tokio::test]
    async fn busy_primary_session_skips() {
        let task = Task::new("disk", "Check disk space");
        let settings = HeartbeatSettings {
            lease_timeout_ms: 50,
            ..HeartbeatSettings::default()
        };
        let f = fixture_with(vec![Ok("HEARTBEAT_OK")], Some(vec![task]), settings);

        let _held = f
            .store
            .lease("ops.primary", StdDuration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let outcome = f.runner.run_heartbeat("ops", Utc::now()).await;
        assert_eq!(outcome, HeartbeatOutcome::Skipped(SkipReason::Busy));
        assert!(f.agent.prompts().is_empty());
        assert_eq!(load_tasks(&f.document).get("disk").unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn isolated_task_runs_in_job_session() {
        let task = Task::new("report", "Weekly report").with_mode(ExecutionMode::Isolated);
        let f = fixture(vec![Ok("Report ready: 3 incidents.")], Some(vec![task]));

        let outcome = f.runner.run_heartbeat("ops", Utc::now()).await;
        assert_eq!(outcome, HeartbeatOutcome::Delivered);

        let sessions = f.agent.sessions.lock().unwrap().clone();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].starts_with("ops.job."));
        assert!(f.store.exists(&sessions[0]));

        let record = primary_record(&f.store).await;
        assert_eq!(record.mailbox.len(), 1);
        assert_eq!(record.mailbox[0].event_type, "task_result");
        assert_eq!(record.mailbox[0].source_session_id, sessions[0]);
        assert_eq!(record.mailbox[0].dedupe_key.as_deref(), Some("task:ops:report"));
        assert_eq!(load_tasks(&f.document).get("report").unwrap().state, TaskState::Done);
    }

    #[tokio::test]
    async fn corrupted_document_raises_one_diagnostic() {
        let f = fixture(vec![Ok("HEARTBEAT_OK")], None);
        std::fs::write(&f.document, "```json tasks\n{ not json\n```\n").unwrap();

        let first = f.runner.run_heartbeat("ops", Utc::now()).await;
        assert_eq!(first, HeartbeatOutcome::Delivered);
        assert!(f.agent.prompts()[0].contains("cannot be parsed"));

        let second = f.runner.run_heartbeat("ops", Utc::now()).await;
        assert_eq!(second, HeartbeatOutcome::Suppressed);

        let record = primary_record(&f.store).await;
        assert_eq!(record.mailbox.len(), 1);
        assert_eq!(record.mailbox[0].event_type, "diagnostic");
    }

    #[tokio::test]
    async fn reflection_runs_once_per_window() {
        let now = Utc::now();
        let future = Task::new("later", "Later").with_next_run_at(now + Duration::days(1));
        let settings = HeartbeatSettings {
            reflect_every_minutes: 60,
            ..HeartbeatSettings::default()
        };
        let f = fixture_with(vec![Ok("HEARTBEAT_OK")], Some(vec![future]), settings);

        assert_eq!(f.runner.run_heartbeat("ops", now).await, HeartbeatOutcome::Suppressed);
        assert!(f.agent.prompts()[0].contains("Heartbeat review"));
        assert_eq!(
            f.runner
                .run_heartbeat("ops", now + Duration::minutes(30))
                .await,
            HeartbeatOutcome::Idle
        );
        assert_eq!(
            f.runner
                .run_heartbeat("ops", now + Duration::minutes(61))
                .await,
            HeartbeatOutcome::Suppressed
        );
        assert_eq!(f.agent.prompts().len(), 2);
    }

    #[tokio::test]
    async fn stuck_running_task_is_healed_before_classification() {
        let now = Utc::now();
        let mut stuck = Task::new("disk", "Check disk space");
        stuck.state = TaskState::Running;
        stuck.timeout_seconds = 60;
        stuck.last_run_at = Some(now - Duration::hours(1));
        let f = fixture(vec![Ok("HEARTBEAT_OK")], Some(vec![stuck]));

        assert_eq!(f.runner.run_heartbeat("ops", now).await, HeartbeatOutcome::Suppressed);
        assert_eq!(load_tasks(&f.document).get("disk").unwrap().state, TaskState::Done);
    }

    #[tokio::test]
    async fn inline_turn_acknowledges_the_mail_it_was_shown() {
        let now = Utc::now();
        let task = Task::new("disk", "Check disk space").with_schedule("1h");
        let f = fixture(vec![Ok("HEARTBEAT_OK")], Some(vec![task]));
        let event = SystemEvent::new("task_result", "ops.job.1", "Backup finished", now)
            .with_event_id("backup-1");
        f.runner
            .mailbox()
            .deposit(&SessionKey::primary("ops"), event)
            .await
            .unwrap();

        assert_eq!(f.runner.run_heartbeat("ops", now).await, HeartbeatOutcome::Suppressed);
        assert!(f.agent.prompts()[0].contains("Backup finished"));
        assert!(primary_record(&f.store).await.mailbox.is_empty());

        let later = now + Duration::hours(1);
        assert_eq!(f.runner.run_heartbeat("ops", later).await, HeartbeatOutcome::Suppressed);
        let prompts = f.agent.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[1].contains("Backup finished"));
    }

    #[tokio::test]
    async fn superseded_run_does_not_record_its_result() {
        let now = Utc::now();
        let task = Task::new("report", "Weekly report").with_mode(ExecutionMode::Isolated);
        let f = fixture(vec![Err("invalid api key")], Some(vec![task]));
        let binding = f.runner.binding("ops").unwrap();

        assert!(f.runner.claim_task("ops", "report", now).await.unwrap());
        let first_run = f.runner.claimed_copy(binding, "report").unwrap();
        assert!(first_run.run_id.is_some());

        // Released as stuck and claimed again while the first run was still going.
        let doc = TaskDocument::new(&f.document, ScheduleEngine::interval_only());
        let mut list = load_tasks(&f.document);
        list.get_mut("report").unwrap().run_id = Some("second-claim".to_owned());
        doc.save(&list).unwrap();

        assert!(f.runner.execute_isolated(binding, &first_run, now).await.is_err());
        let report = load_tasks(&f.document).get("report").cloned().unwrap();
        assert_eq!(report.state, TaskState::Running);
        assert_eq!(report.retry, 0);
        assert_eq!(report.run_id.as_deref(), Some("second-claim"));

        let second_run = f.runner.claimed_copy(binding, "report").unwrap();
        assert!(f.runner.execute_isolated(binding, &second_run, now).await.is_err());
        let report = load_tasks(&f.document).get("report").cloned().unwrap();
        assert_eq!(report.state, TaskState::Pending);
        assert_eq!(report.retry, 1);
        assert_eq!(report.run_id, None);
    }

    #[tokio::test]
    async fn claim_and_due_tasks_callbacks() {
        let now = Utc::now();
        let f = fixture(
            vec![Ok("HEARTBEAT_OK")],
            Some(vec![
                Task::new("a", "A"),
                Task::new("b", "B").with_next_run_at(now + Duration::hours(1)),
            ]),
        );
        let due = f.runner.due_tasks(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].agent, "ops");
        assert_eq!(due[0].task.id, "a");

        assert!(f.runner.claim_task("ops", "a", now).await.unwrap());
        assert!(!f.runner.claim_task("ops", "a", now).await.unwrap());
        assert!(f.runner.claim_task("nobody", "a", now).await.is_err());
    }
}
