//! A restarted daemon picks up where the previous process left off.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, Utc};
use vigil::Scheduler;
use vigil::scheduler::{AgentSchedule, HeartbeatOutcome, SchedulerState};
use vigil::tasks::{Task, TaskState};

use crate::helpers::{ScriptedAgent, Workspace};

fn flaky_agent(healthy: &Arc<AtomicBool>) -> Arc<ScriptedAgent> {
    let healthy = Arc::clone(healthy);
    ScriptedAgent::new(move |_| {
        if healthy.load(Ordering::SeqCst) {
            Ok("HEARTBEAT_OK".to_owned())
        } else {
            Err("connection refused".to_owned())
        }
    })
}

fn scheduler(ws: &Workspace, agent: Arc<ScriptedAgent>) -> Scheduler {
    let scheduler =
        Scheduler::new(Arc::new(ws.runner(agent))).with_state_path(ws.state_path());
    scheduler.register_agent(AgentSchedule::new("ops", 30));
    scheduler
}

#[tokio::test]
async fn backoff_survives_restart() {
    let ws = Workspace::new();
    let now = Utc::now();
    ws.write_tasks(vec![Task::new("disk", "Check disk space").with_schedule("1h")]);
    let healthy = Arc::new(AtomicBool::new(false));

    let first = scheduler(&ws, flaky_agent(&healthy));
    let report = first.tick(now).await;
    assert!(matches!(report.heartbeats[0].1, HeartbeatOutcome::Failed(_)));
    drop(first);

    let saved = SchedulerState::load(&ws.state_path()).unwrap();
    assert_eq!(saved.agents["ops"].consecutive_failures, 1);

    healthy.store(true, Ordering::SeqCst);
    let restarted = scheduler(&ws, flaky_agent(&healthy));
    assert_eq!(restarted.load_state(), 1);
    let schedule = restarted.schedule("ops").unwrap();
    assert_eq!(schedule.consecutive_failures, 1);
    assert_eq!(schedule.next_heartbeat_at, Some(now + Duration::minutes(60)));

    // Still inside the backoff window.
    let report = restarted.tick(now + Duration::minutes(5)).await;
    assert!(report.heartbeats.is_empty());

    let report = restarted.tick(now + Duration::minutes(60)).await;
    assert_eq!(report.heartbeats.len(), 1);
    assert!(report.heartbeats[0].1.is_success());
    assert_eq!(restarted.schedule("ops").unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn corrupt_state_file_starts_every_agent_fresh() {
    let ws = Workspace::new();
    ws.write_tasks(vec![Task::new("disk", "Check disk space")]);
    std::fs::write(ws.state_path(), "{\"agents\": ").unwrap();

    let agent = ScriptedAgent::quiet();
    let scheduler = scheduler(&ws, Arc::clone(&agent));
    assert_eq!(scheduler.load_state(), 0);

    let report = scheduler.tick(Utc::now()).await;
    assert_eq!(
        report.heartbeats,
        vec![("ops".to_owned(), HeartbeatOutcome::Suppressed)]
    );
    assert_eq!(agent.turns().len(), 1);
    // The next save replaces the garbage.
    assert!(SchedulerState::load(&ws.state_path()).is_ok());
}

#[tokio::test]
async fn task_abandoned_by_a_crashed_run_is_picked_up_again() {
    let ws = Workspace::new();
    let now = Utc::now();
    let mut orphan = Task::new("disk", "Check disk space");
    orphan.state = TaskState::Running;
    orphan.last_run_at = Some(now - Duration::hours(3));
    ws.write_tasks(vec![orphan]);

    let agent = ScriptedAgent::quiet();
    let scheduler = scheduler(&ws, Arc::clone(&agent));
    let report = scheduler.tick(now).await;

    assert_eq!(
        report.heartbeats,
        vec![("ops".to_owned(), HeartbeatOutcome::Suppressed)]
    );
    assert!(agent.turns()[0].prompt.contains("[disk] Check disk space"));
    assert_eq!(ws.tasks().get("disk").unwrap().state, TaskState::Done);
}

#[tokio::test]
async fn recently_started_task_is_left_alone() {
    let ws = Workspace::new();
    let now = Utc::now();
    let mut running = Task::new("disk", "Check disk space");
    running.state = TaskState::Running;
    running.last_run_at = Some(now - Duration::minutes(1));
    ws.write_tasks(vec![running]);

    let agent = ScriptedAgent::quiet();
    let scheduler = scheduler(&ws, Arc::clone(&agent));
    let report = scheduler.tick(now).await;

    assert_eq!(
        report.heartbeats,
        vec![("ops".to_owned(), HeartbeatOutcome::Idle)]
    );
    assert!(agent.turns().is_empty());
    assert_eq!(ws.tasks().get("disk").unwrap().state, TaskState::Running);
}
