//! Centralized directory paths for vigil.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data | `~/Library/Application Support/vigil/` | `~/.local/share/vigil/` |
//! | Config | `~/Library/Application Support/vigil/` | `~/.config/vigil/` |
//!
//! # Environment Overrides
//!
//! - `VIGIL_DATA_DIR` overrides [`data_dir`]
//! - `VIGIL_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root: sessions, logs, agent workspaces.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VIGIL_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("vigil"))
        .unwrap_or_else(|| PathBuf::from("/tmp/vigil-data"))
}

/// Application config directory: `config.toml` and `scheduler.json`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VIGIL_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("vigil"))
        .unwrap_or_else(|| PathBuf::from("/tmp/vigil-config"))
}

/// Session records directory (`data_dir()/sessions/`).
#[must_use]
pub fn sessions_dir() -> PathBuf {
    data_dir().join("sessions")
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Per-agent workspace (`data_dir()/agents/{agent}/`).
#[must_use]
pub fn agent_dir(agent: &str) -> PathBuf {
    data_dir().join("agents").join(agent)
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Scheduler crash-resume state (`config_dir()/scheduler.json`).
#[must_use]
pub fn scheduler_file() -> PathBuf {
    config_dir().join("scheduler.json")
}
