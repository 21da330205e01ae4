//! Agent runtime backed by an external process speaking JSON lines.
//!
//! Each turn spawns the configured command and exchanges newline-delimited
//! JSON over stdio:
//! - **Request**: one [`ProcessRequest`] line written to stdin, then EOF
//! - **Replies**: [`ProcessLine`]s read from stdout until `done` or EOF
//!
//! The process is stateless between turns: the session's snapshot is sent
//! with every request and the process may answer with a `state` line to
//! replace it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{
    AgentError, AgentEvent, AgentEventStream, AgentProvider, AgentRuntime, AgentSnapshot,
    TurnRequest,
};
use crate::session::{SessionKey, SessionType};

/// Request written to the process's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessRequest<'a> {
    pub session_id: &'a str,
    #[serde(flatten)]
    pub turn: &'a TurnRequest,
    pub state: &'a AgentSnapshot,
}

/// One line read from the process's stdout.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessLine {
    /// A progress event.
    Event { event: AgentEvent },
    /// Replacement conversational state.
    State {
        #[serde(flatten)]
        snapshot: AgentSnapshot,
    },
    /// The turn failed; the message is classified by the orchestrator.
    Error { message: String },
    /// The turn finished.
    Done,
}

/// Parse one stdout line; `None` for blank or unrecognized lines.
pub fn parse_line(line: &str) -> Option<ProcessLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::debug!("ignoring agent process line ({e}): {line}");
            None
        }
    }
}

/// Runtime that runs each turn in a fresh child process.
pub struct ProcessAgent {
    program: PathBuf,
    args: Vec<String>,
    session_id: String,
    state: Arc<Mutex<AgentSnapshot>>,
}

impl ProcessAgent {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, session_id: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            session_id: session_id.into(),
            state: Arc::new(Mutex::new(AgentSnapshot::default())),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn snapshot(&self) -> Result<AgentSnapshot, AgentError> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| AgentError::new("agent state lock poisoned"))
    }
}

#[async_trait]
impl AgentRuntime for ProcessAgent {
    async fn run_turn(&self, request: &TurnRequest) -> Result<AgentEventStream, AgentError> {
        let snapshot = self.snapshot()?;
        let mut line = serde_json::to_string(&ProcessRequest {
            session_id: &self.session_id,
            turn: request,
            state: &snapshot,
        })
        .map_err(|e| AgentError::new(format!("failed to serialize agent request: {e}")))?;
        line.push('\n');

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::new(format!(
                    "failed to spawn agent process {}: {e}",
                    self.program.display()
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::new("failed to capture agent stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::new("failed to capture agent stdout"))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::new(format!("failed to write to agent stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::new(format!("failed to flush agent stdin: {e}")))?;
        // EOF tells the process the request is complete.
        drop(stdin);

        tracing::debug!(session_id = %self.session_id, "agent process spawned: {}", self.program.display());

        let state = Arc::clone(&self.state);
        Ok(Box::pin(async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let raw = match lines.next_line().await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(AgentError::new(format!("failed to read agent stdout: {e}")));
                        return;
                    }
                };
                match parse_line(&raw) {
                    None => {}
                    Some(ProcessLine::Event { event }) => yield Ok(event),
                    Some(ProcessLine::State { snapshot }) => {
                        if let Ok(mut guard) = state.lock() {
                            *guard = snapshot;
                        }
                    }
                    Some(ProcessLine::Error { message }) => {
                        yield Err(AgentError::new(message));
                        return;
                    }
                    Some(ProcessLine::Done) => return,
                }
            }

            // EOF without `done`: the exit status decides.
            match child.wait().await {
                Ok(status) if status.success() => {}
                Ok(status) => yield Err(AgentError::new(format!("agent process exited with {status}"))),
                Err(e) => yield Err(AgentError::new(format!("failed to wait for agent process: {e}"))),
            }
        }))
    }

    async fn export_state(&self) -> Result<AgentSnapshot, AgentError> {
        self.snapshot()
    }

    async fn import_state(&self, snapshot: AgentSnapshot) -> Result<(), AgentError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| AgentError::new("agent state lock poisoned"))?;
        *guard = snapshot;
        Ok(())
    }
}

/// Opens [`ProcessAgent`]s, one per session.
///
/// Runtimes for long-lived sessions are reused; job sessions always get a
/// fresh runtime.
pub struct ProcessAgentProvider {
    program: PathBuf,
    args: Vec<String>,
    runtimes: Mutex<HashMap<String, Arc<ProcessAgent>>>,
}

impl ProcessAgentProvider {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            runtimes: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AgentProvider for ProcessAgentProvider {
    async fn open(&self, session: &SessionKey) -> Result<Arc<dyn AgentRuntime>, AgentError> {
        let fresh = || Arc::new(ProcessAgent::new(self.program.clone(), self.args.clone(), session.id.clone()));
        if session.session_type == SessionType::Job {
            return Ok(fresh());
        }
        let mut runtimes = self
            .runtimes
            .lock()
            .map_err(|_| AgentError::new("agent registry lock poisoned"))?;
        let runtime = runtimes.entry(session.id.clone()).or_insert_with(fresh);
        Ok(Arc::clone(runtime) as Arc<dyn AgentRuntime>)
    }
}
