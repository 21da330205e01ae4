//! Heartbeats driven through a real child process speaking JSON lines.

#![cfg(unix)]

use std::sync::Arc;

use chrono::Utc;
use vigil::agent::process::ProcessAgentProvider;
use vigil::heartbeat::HeartbeatSettings;
use vigil::orchestrator::TurnPolicy;
use vigil::scheduler::{AgentSchedule, HeartbeatOutcome};
use vigil::tasks::{ExecutionMode, Task, TaskState};
use vigil::{AgentBinding, HeartbeatRunner, Scheduler};

use crate::helpers::{Workspace, task_document};

const REPORTING_AGENT: &str = r#"read -r req
case "$req" in
  *"Weekly report"*) text='Report ready: 3 hosts patched.' ;;
  *) text='HEARTBEAT_OK' ;;
esac
printf '{"type":"event","event":{"stage":"llm","text":"%s"}}\n' "$text"
printf '%s\n' '{"type":"state","variables":{"last_runner":"sh"}}'
printf '%s\n' '{"type":"done"}'"#;

fn scheduler(ws: &Workspace, script: &str) -> Scheduler {
    let provider = ProcessAgentProvider::new("sh", vec!["-c".into(), script.into()]);
    let runner = HeartbeatRunner::new(
        Arc::clone(&ws.store),
        TurnPolicy {
            max_attempts: 1,
            ..TurnPolicy::default()
        },
        HeartbeatSettings {
            lease_timeout_ms: 100,
            ..HeartbeatSettings::default()
        },
    )
    .with_agent(AgentBinding::new(
        "ops",
        Arc::new(provider),
        task_document(&ws.document),
    ));
    let scheduler = Scheduler::new(Arc::new(runner));
    scheduler.register_agent(AgentSchedule::new("ops", 30));
    scheduler
}

#[tokio::test]
async fn process_agent_reports_and_keeps_state() {
    let ws = Workspace::new();
    ws.write_tasks(vec![
        Task::new("disk", "Check disk space"),
        Task::new("report", "Weekly report").with_mode(ExecutionMode::Isolated),
    ]);

    let report = scheduler(&ws, REPORTING_AGENT).tick(Utc::now()).await;
    assert_eq!(
        report.heartbeats,
        vec![("ops".to_owned(), HeartbeatOutcome::Delivered)]
    );

    let tasks = ws.tasks();
    assert_eq!(tasks.get("disk").unwrap().state, TaskState::Done);
    assert_eq!(tasks.get("report").unwrap().state, TaskState::Done);

    let primary = ws.primary().await;
    assert_eq!(primary.variables["last_runner"], serde_json::json!("sh"));
    assert_eq!(primary.mailbox.len(), 1);
    assert_eq!(primary.mailbox[0].summary, "Report ready: 3 hosts patched.");
}

#[tokio::test]
async fn crashing_process_fails_the_heartbeat() {
    let ws = Workspace::new();
    ws.write_tasks(vec![Task::new("disk", "Check disk space")]);

    let script = "read -r _; echo 'segfault in plugin' >&2; exit 3";
    let report = scheduler(&ws, script).tick(Utc::now()).await;
    assert!(matches!(report.heartbeats[0].1, HeartbeatOutcome::Failed(_)));

    let disk = ws.tasks().get("disk").cloned().unwrap();
    assert_eq!(disk.retry, 1);
    assert!(disk.error_message.is_some());
    assert!(ws.primary().await.mailbox.is_empty());
}
