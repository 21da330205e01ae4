//! Crash-resume snapshot of heartbeat schedules.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schedule::AgentSchedule;
use crate::error::{Result, VigilError};
use crate::persist::write_atomic;

pub const SCHEDULER_STATE_VERSION: u32 = 1;

/// Persisted slice of one [`AgentSchedule`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentScheduleState {
    #[serde(default)]
    pub next_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

/// Scheduler state file contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentScheduleState>,
}

fn default_version() -> u32 {
    SCHEDULER_STATE_VERSION
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            version: SCHEDULER_STATE_VERSION,
            agents: BTreeMap::new(),
        }
    }
}

impl SchedulerState {
    /// Snapshot of the given schedules.
    pub fn capture<'a>(schedules: impl IntoIterator<Item = &'a AgentSchedule>) -> Self {
        Self {
            version: SCHEDULER_STATE_VERSION,
            agents: schedules
                .into_iter()
                .map(|s| {
                    (
                        s.agent.clone(),
                        AgentScheduleState {
                            next_heartbeat_at: s.next_heartbeat_at,
                            consecutive_failures: s.consecutive_failures,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Copy persisted values into `schedule`. Returns whether an entry existed.
    pub fn restore(&self, schedule: &mut AgentSchedule) -> bool {
        match self.agents.get(&schedule.agent) {
            Some(saved) => {
                schedule.next_heartbeat_at = saved.next_heartbeat_at;
                schedule.consecutive_failures = saved.consecutive_failures;
                true
            }
            None => false,
        }
    }

    /// Read the state file.
    ///
    /// A missing file yields the default state.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Scheduler`] if the file exists but cannot be
    /// read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(VigilError::Scheduler(format!(
                    "cannot read state {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            VigilError::Scheduler(format!("cannot parse state {}: {e}", path.display()))
        })
    }

    /// Atomically rewrite the state file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json, None)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = SchedulerState::load(&dir.path().join("scheduler.json")).unwrap();
        assert_eq!(state, SchedulerState::default());
    }

    #[test]
    fn saved_state_restores_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");

        let now = Utc::now();
        let mut ops = AgentSchedule::new("ops", 30);
        ops.record_failure(now);
        SchedulerState::capture([&ops]).save(&path).unwrap();

        let loaded = SchedulerState::load(&path).unwrap();
        let mut fresh = AgentSchedule::new("ops", 30);
        assert!(loaded.restore(&mut fresh));
        assert_eq!(fresh.consecutive_failures, 1);
        assert_eq!(fresh.next_heartbeat_at, ops.next_heartbeat_at);

        let mut other = AgentSchedule::new("research", 30);
        assert!(!loaded.restore(&mut other));
        assert_eq!(other.next_heartbeat_at, None);
    }

    #[test]
    fn garbage_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = SchedulerState::load(&path).unwrap_err();
        assert!(err.to_string().contains("cannot parse state"));
    }
}
