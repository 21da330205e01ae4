//! Policy-enforcing wrapper around one agent turn.
//!
//! [`TurnOrchestrator::run`] drives a single [`AgentRuntime::run_turn`]
//! invocation (plus retries) and yields normalized [`TurnEvent`]s:
//!
//! - **Retry**: transient errors re-invoke the agent up to
//!   [`TurnPolicy::max_attempts`] with exponential backoff; permanent and
//!   unclassified errors end the turn at once.
//! - **Tool budget**: budgeted tool/skill calls beyond
//!   [`TurnPolicy::max_tool_calls`] abort the turn.
//! - **Repeated failure**: one failure signature recurring
//!   [`TurnPolicy::max_same_failure_signature`] times, or
//!   [`TurnPolicy::max_failed_tool_outputs`] failed outputs overall, abort.
//! - **Repeated intent**: one intent signature seen more than
//!   [`TurnPolicy::max_same_tool_intent`] times aborts.
//! - **Cancellation**: the shared token is checked while waiting for each
//!   event and during backoff sleeps.
//!
//! Counters persist across attempts; the answer text restarts with each
//! attempt.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{TurnCounters, TurnErrorKind, TurnEvent};
use super::policy::{ErrorClass, TurnPolicy};
use super::preview::{bounded_preview, json_preview};
use super::signature::{failure_signature, intent_signature};
use crate::agent::{AgentError, AgentEvent, AgentEventStream, AgentRuntime, TurnRequest};
use crate::observability::FIELD_ATTEMPT;

/// Stream of orchestrated turn events, ending with exactly one terminal event.
pub type TurnEventStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send>>;

/// Final result of a turn, folded from its terminal event.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed {
        answer: String,
        counters: TurnCounters,
    },
    Failed {
        kind: TurnErrorKind,
        message: String,
        counters: TurnCounters,
    },
}

impl TurnOutcome {
    /// The answer of a completed turn.
    #[must_use]
    pub fn answer(&self) -> Option<&str> {
        match self {
            Self::Completed { answer, .. } => Some(answer),
            Self::Failed { .. } => None,
        }
    }

    #[must_use]
    pub fn counters(&self) -> TurnCounters {
        match self {
            Self::Completed { counters, .. } | Self::Failed { counters, .. } => *counters,
        }
    }

    /// `"CODE: message"` for failed turns.
    #[must_use]
    pub fn error_text(&self) -> Option<String> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { kind, message, .. } => Some(format!("{}: {message}", kind.code())),
        }
    }
}

/// Per-turn bookkeeping for budgets and circuit breakers.
struct TurnState {
    policy: TurnPolicy,
    counters: TurnCounters,
    answer: String,
    failure_counts: HashMap<String, u32>,
    intent_counts: HashMap<String, u32>,
}

impl TurnState {
    fn new(policy: TurnPolicy) -> Self {
        Self {
            policy,
            counters: TurnCounters::default(),
            answer: String::new(),
            failure_counts: HashMap::new(),
            intent_counts: HashMap::new(),
        }
    }

    fn abort(&self, kind: TurnErrorKind, message: String) -> TurnEvent {
        tracing::warn!(code = kind.code(), "turn aborted: {message}");
        TurnEvent::error(kind, message, self.counters)
    }

    fn complete(&mut self) -> TurnEvent {
        self.counters.answer_chars = self.answer.chars().count();
        TurnEvent::TurnComplete {
            answer: std::mem::take(&mut self.answer),
            counters: self.counters,
        }
    }

    fn tool_call(&mut self, name: String, arguments: serde_json::Value, skill: bool) -> Vec<TurnEvent> {
        let preview = json_preview(
            &arguments,
            self.policy.preview_head_chars,
            self.policy.preview_tail_chars,
        );
        let exempt = self.policy.is_exempt(&name);
        if exempt {
            self.counters.exempt_tool_calls += 1;
            return vec![TurnEvent::ToolCall {
                name,
                arguments: preview,
                skill,
                exempt,
            }];
        }

        self.counters.tool_call_count += 1;
        if self.counters.tool_call_count > self.policy.max_tool_calls {
            let message = format!(
                "tool-call budget exceeded: call {} to '{name}' over a limit of {}",
                self.counters.tool_call_count, self.policy.max_tool_calls
            );
            return vec![self.abort(TurnErrorKind::ToolBudgetExceeded, message)];
        }

        let intent = intent_signature(&name, &arguments);
        let seen = self.intent_counts.entry(intent.clone()).or_insert(0);
        *seen += 1;
        if *seen > self.policy.max_same_tool_intent {
            let message = format!(
                "tool intent '{intent}' repeated {} times (limit {})",
                *seen, self.policy.max_same_tool_intent
            );
            return vec![self.abort(TurnErrorKind::RepeatedIntent, message)];
        }

        vec![TurnEvent::ToolCall {
            name,
            arguments: preview,
            skill,
            exempt,
        }]
    }

    fn tool_output(&mut self, name: String, output: String) -> Vec<TurnEvent> {
        let signature = failure_signature(&output);
        let mut events = vec![TurnEvent::ToolOutput {
            name: name.clone(),
            output: bounded_preview(
                &output,
                self.policy.preview_head_chars,
                self.policy.preview_tail_chars,
            ),
            failure_signature: signature.clone(),
        }];

        let Some(signature) = signature else {
            return events;
        };
        self.counters.failed_tool_outputs += 1;
        let count = self.failure_counts.entry(signature.clone()).or_insert(0);
        *count += 1;
        let count = *count;

        if count >= self.policy.max_same_failure_signature {
            let message = format!(
                "failure '{signature}' from '{name}' occurred {count} times (limit {})",
                self.policy.max_same_failure_signature
            );
            events.push(self.abort(TurnErrorKind::RepeatedFailure, message));
        } else if self.counters.failed_tool_outputs >= self.policy.max_failed_tool_outputs {
            let message = format!(
                "{} failed tool outputs (limit {})",
                self.counters.failed_tool_outputs, self.policy.max_failed_tool_outputs
            );
            events.push(self.abort(TurnErrorKind::FailedOutputLimit, message));
        }
        events
    }

    /// Translate one agent event; a terminal event, if any, is last.
    fn on_event(&mut self, event: AgentEvent) -> Vec<TurnEvent> {
        match event {
            AgentEvent::Llm { text } => {
                self.answer.push_str(&text);
                vec![TurnEvent::LlmDelta { text }]
            }
            AgentEvent::ToolCall { name, arguments } => self.tool_call(name, arguments, false),
            AgentEvent::Skill { name, arguments } => self.tool_call(name, arguments, true),
            AgentEvent::ToolOutput { name, output } => self.tool_output(name, output),
        }
    }
}

enum Started {
    Stream(AgentEventStream),
    Failed(AgentError),
    TimedOut,
    Cancelled,
}

enum Next {
    Item(Option<Result<AgentEvent, AgentError>>),
    TimedOut,
    Cancelled,
}

async fn start_attempt(
    agent: &dyn AgentRuntime,
    request: &TurnRequest,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Started {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Started::Cancelled,
        started = tokio::time::timeout_at(deadline, agent.run_turn(request)) => match started {
            Ok(Ok(stream)) => Started::Stream(stream),
            Ok(Err(e)) => Started::Failed(e),
            Err(_) => Started::TimedOut,
        },
    }
}

async fn next_event(events: &mut AgentEventStream, cancel: &CancellationToken, deadline: Instant) -> Next {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Next::Cancelled,
        item = tokio::time::timeout_at(deadline, events.next()) => match item {
            Ok(item) => Next::Item(item),
            Err(_) => Next::TimedOut,
        },
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn backoff(delay: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Runs conversational turns under a [`TurnPolicy`].
pub struct TurnOrchestrator {
    agent: Arc<dyn AgentRuntime>,
    policy: TurnPolicy,
    cancel: CancellationToken,
}

impl TurnOrchestrator {
    /// Orchestrator over `agent` with its own cancellation token.
    pub fn new(agent: Arc<dyn AgentRuntime>, policy: TurnPolicy) -> Self {
        Self {
            agent,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Share an existing cancellation token (e.g. a child of the daemon's).
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle that cancels turns started by this orchestrator.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The policy in force.
    pub fn policy(&self) -> &TurnPolicy {
        &self.policy
    }

    /// Run one turn, yielding its events.
    pub fn run(&self, request: TurnRequest) -> TurnEventStream {
        let agent = Arc::clone(&self.agent);
        let cancel = self.cancel.clone();
        let policy = self.policy.clone();

        Box::pin(async_stream::stream! {
            let mut state = TurnState::new(policy.clone());
            let max_attempts = policy.max_attempts.max(1);

            loop {
                state.counters.attempts += 1;
                let attempt = state.counters.attempts;
                state.answer.clear();
                let deadline = Instant::now() + policy.timeout();
                tracing::debug!({ FIELD_ATTEMPT } = attempt, max_attempts, "starting turn attempt");

                let failure = match start_attempt(agent.as_ref(), &request, &cancel, deadline).await {
                    Started::Cancelled => {
                        yield state.abort(TurnErrorKind::Cancelled, "turn cancelled".to_owned());
                        return;
                    }
                    Started::TimedOut => None,
                    Started::Failed(e) => Some(e.message),
                    Started::Stream(mut events) => {
                        let mut failure = None;
                        loop {
                            match next_event(&mut events, &cancel, deadline).await {
                                Next::Cancelled => {
                                    yield state.abort(TurnErrorKind::Cancelled, "turn cancelled".to_owned());
                                    return;
                                }
                                Next::TimedOut => break,
                                Next::Item(None) => {
                                    yield state.complete();
                                    return;
                                }
                                Next::Item(Some(Err(e))) => {
                                    failure = Some(e.message);
                                    break;
                                }
                                Next::Item(Some(Ok(event))) => {
                                    for turn_event in state.on_event(event) {
                                        let terminal = turn_event.is_terminal();
                                        yield turn_event;
                                        if terminal {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        failure
                    }
                };

                // `None` here means the attempt timed out, which is always transient.
                let (class, message) = match failure {
                    Some(message) => (policy.classify(&message), message),
                    None => (
                        ErrorClass::Transient,
                        format!("turn attempt timed out after {}s", policy.timeout().as_secs()),
                    ),
                };
                match class {
                    ErrorClass::Permanent => {
                        yield state.abort(TurnErrorKind::Permanent, message);
                        return;
                    }
                    ErrorClass::Execution => {
                        yield state.abort(TurnErrorKind::Execution, message);
                        return;
                    }
                    ErrorClass::Transient if attempt >= max_attempts => {
                        yield state.abort(
                            TurnErrorKind::TransientExhausted,
                            format!("gave up after {attempt} attempts: {message}"),
                        );
                        return;
                    }
                    ErrorClass::Transient => {
                        tracing::warn!(attempt, max_attempts, "transient turn error, retrying: {message}");
                        yield TurnEvent::Status {
                            message: format!("retrying after transient error: {message}"),
                            attempt,
                        };
                        if !backoff(policy.delay_for_attempt(attempt), &cancel).await {
                            yield state.abort(TurnErrorKind::Cancelled, "turn cancelled during retry backoff".to_owned());
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Run one turn to its terminal event, passing every event to `observe`.
    pub async fn run_to_outcome(
        &self,
        request: TurnRequest,
        mut observe: impl FnMut(&TurnEvent),
    ) -> TurnOutcome {
        let mut events = self.run(request);
        while let Some(event) = events.next().await {
            observe(&event);
            match event {
                TurnEvent::TurnComplete { answer, counters } => {
                    return TurnOutcome::Completed { answer, counters };
                }
                TurnEvent::TurnError {
                    kind,
                    message,
                    counters,
                    ..
                } => {
                    return TurnOutcome::Failed {
                        kind,
                        message,
                        counters,
                    };
                }
                _ => {}
            }
        }
        TurnOutcome::Failed {
            kind: TurnErrorKind::Execution,
            message: "turn stream ended without a terminal event".to_owned(),
            counters: TurnCounters::default(),
        }
    }
}
