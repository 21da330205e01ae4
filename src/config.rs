//! Configuration for the vigil daemon.
//!
//! Loaded from a TOML file; every section and field has a default, so an
//! empty file is a valid configuration with no agents.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::error::{Result, VigilError};
use crate::heartbeat::HeartbeatSettings;
use crate::orchestrator::TurnPolicy;
use crate::persist;
use crate::scheduler::schedule::{DEFAULT_INTERVAL_MINUTES, DEFAULT_MAX_BACKOFF_MINUTES};
use crate::scheduler::{ActiveHours, AgentSchedule};
use crate::session::RetentionPolicy;
use crate::session::mailbox::DEFAULT_STALENESS_HOURS;
use crate::session::types::DEFAULT_TIMELINE_CAP;
use crate::vigil_dirs;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub scheduler: SchedulerConfig,
    /// Retry, budget and breaker limits for every turn.
    pub turn: TurnPolicy,
    pub sessions: SessionsConfig,
    pub heartbeat: HeartbeatSettings,
    pub logging: LoggingConfig,
    /// Agents kept alive by this daemon.
    pub agents: Vec<AgentConfig>,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// Heartbeat interval for agents that do not set one.
    pub default_interval_minutes: u32,
    /// Backoff ceiling for agents that do not set one.
    pub default_max_backoff_minutes: u32,
    /// Crash-resume state file (None = `config_dir()/scheduler.json`).
    pub state_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 30,
            default_interval_minutes: DEFAULT_INTERVAL_MINUTES,
            default_max_backoff_minutes: DEFAULT_MAX_BACKOFF_MINUTES,
            state_file: None,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(vigil_dirs::scheduler_file)
    }
}

/// `[sessions]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Session records directory (None = `data_dir()/sessions`).
    pub dir: Option<PathBuf>,
    /// How long store operations wait for a session lock.
    pub lock_timeout_ms: u64,
    /// Lock files older than this are considered abandoned.
    pub stale_lock_secs: u64,
    /// Timeline entries kept per session.
    pub timeline_cap: usize,
    /// Hours after which undelivered stale-suppressible mailbox events expire.
    pub mailbox_staleness_hours: i64,
    /// Minutes between job-session retention sweeps. `0` disables.
    pub sweep_interval_minutes: u64,
    pub retention: RetentionPolicy,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            lock_timeout_ms: 5_000,
            stale_lock_secs: 600,
            timeline_cap: DEFAULT_TIMELINE_CAP,
            mailbox_staleness_hours: DEFAULT_STALENESS_HOURS,
            sweep_interval_minutes: 60,
            retention: RetentionPolicy::default(),
        }
    }
}

impl SessionsConfig {
    pub fn dir_path(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(vigil_dirs::sessions_dir)
    }

    pub fn lock_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_lock_after(&self) -> StdDuration {
        StdDuration::from_secs(self.stale_lock_secs)
    }

    /// Mailbox staleness window; out-of-range values mean "never stale".
    pub fn mailbox_staleness(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.mailbox_staleness_hours.max(0))
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub filter: String,
    /// Also write logs to daily-rotated files under `file_dir`.
    pub file_enabled: bool,
    /// Log directory (None = `data_dir()/logs`).
    pub file_dir: Option<PathBuf>,
    /// Emit ANSI colours on stderr.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "vigil=info".to_owned(),
            file_enabled: false,
            file_dir: None,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn file_dir_path(&self) -> PathBuf {
        self.file_dir.clone().unwrap_or_else(vigil_dirs::logs_dir)
    }
}

/// One `[[agents]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Agent process speaking the JSON-lines protocol. Agents without a
    /// command are scheduled but skipped as unconfigured.
    #[serde(default)]
    pub command: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Task document (None = `agent_dir(name)/HEARTBEAT.md`).
    #[serde(default)]
    pub task_document: Option<PathBuf>,
    /// System prompt override for heartbeat and task turns.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub max_backoff_minutes: Option<u32>,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
    /// Tools and skills described in the review prompt.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Enabled agent with defaults for everything else.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            command: None,
            args: Vec::new(),
            task_document: None,
            system_prompt: None,
            interval_minutes: None,
            max_backoff_minutes: None,
            active_hours: None,
            capabilities: Vec::new(),
        }
    }

    pub fn task_document_path(&self) -> PathBuf {
        self.task_document
            .clone()
            .unwrap_or_else(|| vigil_dirs::agent_dir(&self.name).join("HEARTBEAT.md"))
    }

    /// Heartbeat schedule, falling back to the scheduler defaults.
    pub fn schedule(&self, defaults: &SchedulerConfig) -> AgentSchedule {
        let mut schedule = AgentSchedule::new(
            self.name.clone(),
            self.interval_minutes
                .unwrap_or(defaults.default_interval_minutes),
        )
        .with_max_backoff_minutes(
            self.max_backoff_minutes
                .unwrap_or(defaults.default_max_backoff_minutes),
        );
        if let Some(hours) = &self.active_hours {
            schedule = schedule.with_active_hours(hours.clone());
        }
        schedule
    }
}

impl VigilConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| VigilError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults.
    ///
    /// # Errors
    ///
    /// Same as [`from_file`](Self::from_file) for an existing file.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration atomically, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be serialized or written.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| VigilError::Config(e.to_string()))?;
        persist::write_atomic(path, content.as_bytes(), None)
    }

    /// Config path: `$VIGIL_CONFIG` if set, else `config_dir()/config.toml`.
    pub fn default_config_path() -> PathBuf {
        std::env::var_os("VIGIL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(vigil_dirs::config_file)
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.turn.max_attempts == 0 {
            return Err(VigilError::Config("turn.max_attempts must be at least 1".into()));
        }
        if self.heartbeat.ack_token.trim().is_empty() {
            return Err(VigilError::Config("heartbeat.ack_token must not be empty".into()));
        }
        let mut names = BTreeSet::new();
        for agent in &self.agents {
            let name = agent.name.trim();
            if name.is_empty() {
                return Err(VigilError::Config("agent name must not be empty".into()));
            }
            if !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
            {
                return Err(VigilError::Config(format!(
                    "agent name '{name}' may only contain letters, digits, '_' and '-'"
                )));
            }
            if !names.insert(name) {
                return Err(VigilError::Config(format!("duplicate agent '{name}'")));
            }
            if agent.interval_minutes == Some(0) {
                return Err(VigilError::Config(format!(
                    "agent '{name}': interval_minutes must be at least 1"
                )));
            }
            if let Some(hours) = &agent.active_hours {
                hours
                    .validate()
                    .map_err(|e| VigilError::Config(format!("agent '{name}': {e}")))?;
            }
        }
        Ok(())
    }

    /// Enabled agents.
    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.iter().filter(|a| a.enabled)
    }
}
