//! Scheduler → heartbeat runner → orchestrator → store, end to end.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use vigil::bus::VigilEvent;
use vigil::scheduler::{AgentSchedule, HeartbeatOutcome, SkipReason};
use vigil::tasks::{ExecutionMode, Task, TaskState};
use vigil::{Mailbox, Scheduler};

use crate::helpers::{ScriptedAgent, Workspace, drain_events};

fn report_writer() -> Arc<ScriptedAgent> {
    ScriptedAgent::new(|prompt| {
        if prompt.contains("Weekly report") {
            Ok("Weekly report: 2 incidents, both resolved.".to_owned())
        } else {
            Ok("HEARTBEAT_OK".to_owned())
        }
    })
}

#[tokio::test]
async fn heartbeat_runs_due_tasks_and_delivers_only_reports() {
    let ws = Workspace::new();
    let now = Utc::now();
    ws.write_tasks(vec![
        Task::new("disk", "Check disk space").with_schedule("1h"),
        Task::new("report", "Weekly report").with_mode(ExecutionMode::Isolated),
        Task::new("later", "Rotate keys").with_next_run_at(now + Duration::days(2)),
    ]);
    let agent = report_writer();
    let scheduler = Scheduler::new(Arc::new(ws.runner(Arc::clone(&agent))))
        .with_state_path(ws.state_path())
        .with_bus(ws.bus.clone());
    scheduler.register_agent(AgentSchedule::new("ops", 30));
    let mut rx = ws.bus.subscribe();

    let report = scheduler.tick(now).await;
    assert_eq!(
        report.heartbeats,
        vec![("ops".to_owned(), HeartbeatOutcome::Delivered)]
    );
    // Everything due was handled inside the heartbeat.
    assert_eq!(report.inline_batches, 0);
    assert_eq!(report.isolated_claimed, 0);

    let turns = agent.turns();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].session_id, "ops.primary");
    assert!(turns[0].prompt.contains("[disk] Check disk space"));
    assert!(!turns[0].prompt.contains("Rotate keys"));
    assert!(turns[1].session_id.starts_with("ops.job."));

    let tasks = ws.tasks();
    let disk = tasks.get("disk").unwrap();
    assert_eq!(disk.state, TaskState::Pending);
    assert_eq!(disk.next_run_at, Some(now + Duration::hours(1)));
    assert_eq!(tasks.get("report").unwrap().state, TaskState::Done);
    assert_eq!(tasks.get("later").unwrap().state, TaskState::Pending);

    let primary = ws.primary().await;
    assert_eq!(primary.mailbox.len(), 1);
    assert_eq!(primary.mailbox[0].event_type, "task_result");
    assert_eq!(
        primary.mailbox[0].summary,
        "Weekly report: 2 incidents, both resolved."
    );
    assert_eq!(primary.variables["turns"], serde_json::json!(1));

    let events = drain_events(&mut rx);
    assert!(events.contains(&VigilEvent::HeartbeatStarted { agent: "ops".into() }));
    assert!(events.contains(&VigilEvent::TaskClaimed {
        agent: "ops".into(),
        task_id: "report".into(),
    }));
    assert!(events.iter().any(|e| matches!(
        e,
        VigilEvent::Notification { summary, .. } if summary.starts_with("Weekly report")
    )));
    assert!(events.contains(&VigilEvent::HeartbeatFinished {
        agent: "ops".into(),
        outcome: "delivered".into(),
    }));

    // Five minutes later nothing is due.
    let report = scheduler.tick(now + Duration::minutes(5)).await;
    assert!(report.is_empty());
    assert_eq!(agent.turns().len(), 2);
    assert!(ws.state_path().exists());
}

#[tokio::test]
async fn tasks_due_between_heartbeats_run_in_the_task_pass() {
    let ws = Workspace::new();
    let now = Utc::now();
    ws.write_tasks(vec![
        Task::new("inbox", "Triage inbox"),
        Task::new("report", "Weekly report").with_mode(ExecutionMode::Isolated),
    ]);
    let agent = report_writer();
    let scheduler = Scheduler::new(Arc::new(ws.runner(Arc::clone(&agent))));
    let mut schedule = AgentSchedule::new("ops", 30);
    schedule.record_success(now - Duration::minutes(1));
    scheduler.register_agent(schedule);

    let report = scheduler.tick(now).await;
    assert!(report.heartbeats.is_empty());
    assert_eq!(report.inline_batches, 1);
    assert_eq!(report.isolated_claimed, 1);
    assert_eq!(report.task_failures, 0);

    let tasks = ws.tasks();
    assert_eq!(tasks.get("inbox").unwrap().state, TaskState::Done);
    assert_eq!(tasks.get("report").unwrap().state, TaskState::Done);
    assert_eq!(agent.turns().len(), 2);
}

#[tokio::test]
async fn delivered_reports_can_be_drained_and_acked() {
    let ws = Workspace::new();
    ws.write_tasks(vec![
        Task::new("report", "Weekly report").with_mode(ExecutionMode::Isolated),
    ]);
    let scheduler = Scheduler::new(Arc::new(ws.runner(report_writer())));
    scheduler.register_agent(AgentSchedule::new("ops", 30));
    scheduler.tick(Utc::now()).await;

    let mailbox = Mailbox::new(Arc::clone(&ws.store));
    let drain = mailbox.drain("ops.primary").await.unwrap().acquired().unwrap();
    assert_eq!(drain.events.len(), 1);
    assert!(drain.render().contains("Weekly report"));

    // Draining does not remove anything; acking does.
    let again = mailbox.drain("ops.primary").await.unwrap().acquired().unwrap();
    assert_eq!(again.ack_ids, drain.ack_ids);
    let removed = mailbox
        .ack("ops.primary", &drain.ack_ids)
        .await
        .unwrap()
        .acquired()
        .unwrap();
    assert_eq!(removed, 1);
    assert!(ws.primary().await.mailbox.is_empty());
}

#[tokio::test]
async fn failing_agent_backs_off_and_recovers() {
    let ws = Workspace::new();
    let now = Utc::now();
    ws.write_tasks(vec![Task::new("disk", "Check disk space").with_schedule("10m")]);
    let healthy = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&healthy);
    let agent = ScriptedAgent::new(move |_| {
        if flag.load(std::sync::atomic::Ordering::SeqCst) {
            Ok("HEARTBEAT_OK".to_owned())
        } else {
            Err("invalid api key".to_owned())
        }
    });
    let scheduler = Scheduler::new(Arc::new(ws.runner(agent)));
    scheduler.register_agent(AgentSchedule::new("ops", 30));

    let report = scheduler.tick(now).await;
    assert!(matches!(report.heartbeats[0].1, HeartbeatOutcome::Failed(_)));
    let schedule = scheduler.schedule("ops").unwrap();
    assert_eq!(schedule.consecutive_failures, 1);
    assert_eq!(schedule.next_heartbeat_at, Some(now + Duration::minutes(60)));

    // The failed task retries on its own delay, so the heartbeat an hour
    // later finds it due again.
    healthy.store(true, std::sync::atomic::Ordering::SeqCst);
    let later = now + Duration::minutes(60);
    let report = scheduler.tick(later).await;
    assert_eq!(
        report.heartbeats,
        vec![("ops".to_owned(), HeartbeatOutcome::Suppressed)]
    );
    assert_eq!(scheduler.schedule("ops").unwrap().consecutive_failures, 0);
    let disk = ws.tasks().get("disk").cloned().unwrap();
    assert_eq!(disk.retry, 0);
    assert_eq!(disk.next_run_at, Some(later + Duration::minutes(10)));
}

#[tokio::test]
async fn busy_session_skips_without_backoff() {
    let ws = Workspace::new();
    let now = Utc::now();
    ws.write_tasks(vec![Task::new("disk", "Check disk space")]);
    let agent = ScriptedAgent::quiet();
    let scheduler = Scheduler::new(Arc::new(ws.runner(Arc::clone(&agent))));
    scheduler.register_agent(AgentSchedule::new("ops", 30));

    let lease = ws
        .store
        .lease("ops.primary", StdDuration::from_secs(1))
        .await
        .unwrap()
        .expect("lease");
    let report = scheduler.tick(now).await;
    assert_eq!(
        report.heartbeats,
        vec![("ops".to_owned(), HeartbeatOutcome::Skipped(SkipReason::Busy))]
    );
    let schedule = scheduler.schedule("ops").unwrap();
    assert_eq!(schedule.consecutive_failures, 0);
    assert!(schedule.is_due(now));
    assert!(agent.turns().is_empty());

    drop(lease);
    let report = scheduler.tick(now + Duration::seconds(30)).await;
    assert_eq!(
        report.heartbeats,
        vec![("ops".to_owned(), HeartbeatOutcome::Suppressed)]
    );
    assert_eq!(ws.tasks().get("disk").unwrap().state, TaskState::Done);
}
