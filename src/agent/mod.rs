//! Agent execution interface.
//!
//! The engine never generates responses itself. An [`AgentRuntime`] runs one
//! conversational turn and streams progress events tagged by stage; an
//! [`AgentProvider`] opens a runtime for a given session. Session state is
//! moved in and out with [`AgentSnapshot`]s so the session store stays the
//! source of truth.

pub mod process;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::session::{HistoryMessage, SessionKey};

/// Error raised by an agent runtime.
///
/// The message text is what the orchestrator classifies as transient or
/// permanent, so runtimes should pass provider error text through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
}

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One progress event from a running turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Model text delta.
    Llm { text: String },
    /// A tool invocation.
    ToolCall {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// A skill invocation (counted like a tool call).
    Skill {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// Output returned by a tool or skill.
    ToolOutput { name: String, output: String },
}

/// Stream of progress events; an `Err` item ends the turn with that error.
pub type AgentEventStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, AgentError>> + Send>>;

/// Input for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    /// Replaces the agent's configured system prompt for this turn only.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    /// Input for resuming a turn that paused for confirmation.
    #[serde(default)]
    pub resume: Option<String>,
}

fn default_streaming() -> bool {
    true
}

impl TurnRequest {
    /// Streaming request with no overrides.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            system_prompt: None,
            streaming: true,
            resume: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Exportable conversational state of a runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

/// Runs conversational turns for one session.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Start a turn. Errors returned here (before any event) are retried
    /// by the orchestrator like errors yielded from the stream.
    async fn run_turn(&self, request: &TurnRequest) -> Result<AgentEventStream, AgentError>;

    /// Current conversational state.
    async fn export_state(&self) -> Result<AgentSnapshot, AgentError>;

    /// Replace the conversational state.
    async fn import_state(&self, snapshot: AgentSnapshot) -> Result<(), AgentError>;
}

/// Opens runtimes for sessions.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// A runtime bound to `session`. Job sessions get a fresh runtime.
    async fn open(&self, session: &SessionKey) -> Result<Arc<dyn AgentRuntime>, AgentError>;
}
