//! Shared helpers for integration tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use vigil::agent::{
    AgentError, AgentEvent, AgentEventStream, AgentProvider, AgentRuntime, AgentSnapshot,
    TurnRequest,
};
use vigil::bus::{EventBus, VigilEvent};
use vigil::heartbeat::HeartbeatSettings;
use vigil::orchestrator::TurnPolicy;
use vigil::session::{SessionKey, SessionRecord};
use vigil::tasks::{ParseOutcome, ScheduleEngine, Task, TaskDocument, TaskList};
use vigil::{AgentBinding, FsSessionStore, HeartbeatRunner};

/// One recorded turn: which session, which prompt.
#[derive(Debug, Clone)]
pub(crate) struct SeenTurn {
    pub session_id: String,
    pub prompt: String,
}

/// Agent whose answers are chosen by a closure over the prompt.
///
/// Keeps one snapshot per session so state round-trips through the store
/// like a real runtime.
pub(crate) struct ScriptedAgent {
    answer: Box<dyn Fn(&str) -> Result<String, String> + Send + Sync>,
    turns: Mutex<Vec<SeenTurn>>,
}

impl ScriptedAgent {
    pub(crate) fn new(
        answer: impl Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            answer: Box::new(answer),
            turns: Mutex::new(Vec::new()),
        })
    }

    /// Acknowledge everything.
    pub(crate) fn quiet() -> Arc<Self> {
        Self::new(|_| Ok("HEARTBEAT_OK".to_owned()))
    }

    pub(crate) fn turns(&self) -> Vec<SeenTurn> {
        self.turns.lock().unwrap().clone()
    }
}

struct SessionRuntime {
    agent: Arc<ScriptedAgent>,
    session_id: String,
    state: Mutex<AgentSnapshot>,
}

#[async_trait]
impl AgentRuntime for SessionRuntime {
    async fn run_turn(&self, request: &TurnRequest) -> Result<AgentEventStream, AgentError> {
        self.agent.turns.lock().unwrap().push(SeenTurn {
            session_id: self.session_id.clone(),
            prompt: request.message.clone(),
        });
        let item = match (self.agent.answer)(&request.message) {
            Ok(text) => {
                let mut state = self.state.lock().unwrap();
                let turns = state
                    .variables
                    .get("turns")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(0);
                state.variables.insert("turns".into(), (turns + 1).into());
                Ok(AgentEvent::Llm { text })
            }
            Err(message) => Err(AgentError::new(message)),
        };
        Ok(Box::pin(futures_util::stream::iter(vec![item])))
    }

    async fn export_state(&self) -> Result<AgentSnapshot, AgentError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn import_state(&self, snapshot: AgentSnapshot) -> Result<(), AgentError> {
        *self.state.lock().unwrap() = snapshot;
        Ok(())
    }
}

/// Provider handing out a fresh [`SessionRuntime`] per open.
pub(crate) struct ScriptedProvider(pub Arc<ScriptedAgent>);

#[async_trait]
impl AgentProvider for ScriptedProvider {
    async fn open(&self, session: &SessionKey) -> Result<Arc<dyn AgentRuntime>, AgentError> {
        Ok(Arc::new(SessionRuntime {
            agent: Arc::clone(&self.0),
            session_id: session.id.clone(),
            state: Mutex::new(AgentSnapshot::default()),
        }))
    }
}

/// A temp workspace with a session store and one agent's task document.
pub(crate) struct Workspace {
    pub dir: tempfile::TempDir,
    pub store: Arc<FsSessionStore>,
    pub document: PathBuf,
    pub bus: EventBus,
}

impl Workspace {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = Arc::new(
            FsSessionStore::new(dir.path().join("sessions"))
                .expect("create store")
                .with_lock_timeout(std::time::Duration::from_millis(200)),
        );
        let document = dir.path().join("HEARTBEAT.md");
        std::fs::write(&document, "# Ops\n\nKeep the servers healthy.\n").expect("write doc");
        Self {
            dir,
            store,
            document,
            bus: EventBus::default(),
        }
    }

    pub(crate) fn state_path(&self) -> PathBuf {
        self.dir.path().join("scheduler.json")
    }

    pub(crate) fn write_tasks(&self, tasks: Vec<Task>) {
        task_document(&self.document)
            .save(&TaskList::new(tasks))
            .expect("save tasks");
    }

    pub(crate) fn tasks(&self) -> TaskList {
        match task_document(&self.document).load().expect("load tasks") {
            ParseOutcome::Ok(list) => list,
            other => panic!("expected a task list, got {other:?}"),
        }
    }

    /// Runner for agent `ops`, with a single-attempt turn policy.
    pub(crate) fn runner(&self, agent: Arc<ScriptedAgent>) -> HeartbeatRunner {
        self.runner_with(
            agent,
            HeartbeatSettings {
                lease_timeout_ms: 100,
                ..HeartbeatSettings::default()
            },
        )
    }

    pub(crate) fn runner_with(
        &self,
        agent: Arc<ScriptedAgent>,
        settings: HeartbeatSettings,
    ) -> HeartbeatRunner {
        let policy = TurnPolicy {
            max_attempts: 1,
            ..TurnPolicy::default()
        };
        HeartbeatRunner::new(Arc::clone(&self.store), policy, settings)
            .with_bus(self.bus.clone())
            .with_agent(AgentBinding::new(
                "ops",
                Arc::new(ScriptedProvider(agent)),
                task_document(&self.document),
            ))
    }

    pub(crate) async fn primary(&self) -> SessionRecord {
        self.store
            .load("ops.primary")
            .await
            .expect("load primary")
            .acquired()
            .flatten()
            .expect("primary session exists")
    }
}

pub(crate) fn task_document(path: &Path) -> TaskDocument {
    TaskDocument::new(path, ScheduleEngine::default())
}

/// Drain all pending events from the broadcast receiver into a Vec.
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<VigilEvent>) -> Vec<VigilEvent> {
    let mut events = Vec::new();
    while let Ok(evt) = rx.try_recv() {
        events.push(evt);
    }
    events
}
