//! Keep-alive daemon.
//!
//! Loads the config (`$VIGIL_CONFIG`, else `config_dir()/config.toml`),
//! starts one JSON-lines agent process per configured agent on demand, and
//! runs the heartbeat scheduler until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use vigil::agent::process::ProcessAgentProvider;
use vigil::bus::{EventBus, VigilEvent};
use vigil::capability::{CapabilityRegistry, StaticCapabilities};
use vigil::session::{RetentionPolicy, sweep_job_sessions};
use vigil::tasks::{ScheduleEngine, TaskDocument};
use vigil::{AgentBinding, FsSessionStore, HeartbeatRunner, Mailbox, Scheduler, VigilConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = VigilConfig::default_config_path();
    let config = VigilConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let _log_guard = vigil::logging::init_tracing(&config.logging)?;

    tracing::info!(
        config = %config_path.display(),
        agents = config.agents.len(),
        "vigil-daemon starting"
    );

    let store = Arc::new(
        FsSessionStore::new(config.sessions.dir_path())?
            .with_lock_timeout(config.sessions.lock_timeout())
            .with_stale_lock_after(config.sessions.stale_lock_after())
            .with_timeline_cap(config.sessions.timeline_cap),
    );
    let mailbox =
        Mailbox::new(Arc::clone(&store)).with_staleness(config.sessions.mailbox_staleness());
    let bus = EventBus::default();
    let shutdown = CancellationToken::new();

    let mut runner = HeartbeatRunner::new(
        Arc::clone(&store),
        config.turn.clone(),
        config.heartbeat.clone(),
    )
    .with_mailbox(mailbox)
    .with_bus(bus.clone())
    .with_cancel_token(shutdown.child_token());

    for agent in config.enabled_agents() {
        let Some(command) = &agent.command else {
            tracing::warn!(agent = %agent.name, "no command configured, heartbeats will be skipped");
            continue;
        };
        let provider = Arc::new(ProcessAgentProvider::new(command.clone(), agent.args.clone()));
        let document = TaskDocument::new(agent.task_document_path(), ScheduleEngine::default());
        let capabilities = CapabilityRegistry::new()
            .with_provider(Arc::new(StaticCapabilities::new(agent.capabilities.clone())));
        let mut binding = AgentBinding::new(agent.name.clone(), provider, document)
            .with_capabilities(capabilities);
        if let Some(prompt) = &agent.system_prompt {
            binding = binding.with_system_prompt(prompt.clone());
        }
        runner.register(binding);
    }

    let scheduler = Arc::new(
        Scheduler::new(Arc::new(runner))
            .with_state_path(config.scheduler.state_path())
            .with_tick_interval(config.scheduler.tick_interval())
            .with_bus(bus.clone())
            .with_cancel_token(shutdown.clone()),
    );
    for agent in config.enabled_agents() {
        scheduler.register_agent(agent.schedule(&config.scheduler));
    }
    let restored = scheduler.load_state();
    tracing::info!(restored, "scheduler state loaded");

    let notifications = tokio::spawn(log_notifications(bus.subscribe()));
    let sweeper = (config.sessions.sweep_interval_minutes > 0).then(|| {
        tokio::spawn(sweep_loop(
            Arc::clone(&store),
            config.sessions.retention.clone(),
            Duration::from_secs(config.sessions.sweep_interval_minutes.saturating_mul(60)),
            shutdown.clone(),
        ))
    });
    let scheduler_task = Arc::clone(&scheduler).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");
    shutdown.cancel();

    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "scheduler task ended abnormally");
    }
    if let Some(sweeper) = sweeper
        && let Err(e) = sweeper.await
    {
        tracing::error!(error = %e, "retention sweep task ended abnormally");
    }
    notifications.abort();

    tracing::info!("vigil-daemon shut down cleanly");
    Ok(())
}

/// Mirror user-facing notifications into the log.
async fn log_notifications(mut rx: tokio::sync::broadcast::Receiver<VigilEvent>) {
    loop {
        match rx.recv().await {
            Ok(VigilEvent::Notification {
                agent,
                summary,
                priority,
            }) => {
                tracing::info!(agent = %agent, ?priority, "notification: {summary}");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Periodically archive and delete old job sessions.
async fn sweep_loop(
    store: Arc<FsSessionStore>,
    policy: RetentionPolicy,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match sweep_job_sessions(&store, &policy, chrono::Utc::now()).await {
            Ok(report) if report.archived + report.deleted > 0 => {
                tracing::info!(
                    archived = report.archived,
                    deleted = report.deleted,
                    busy = report.busy,
                    "job sessions swept"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("job session sweep failed: {e}"),
        }
    }
}
