//! Per-agent heartbeat cadence.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

/// Default heartbeat interval.
pub const DEFAULT_INTERVAL_MINUTES: u32 = 30;

/// Default ceiling for failure backoff.
pub const DEFAULT_MAX_BACKOFF_MINUTES: u32 = 240;

fn parse_clock(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| VigilError::Config(format!("invalid time of day '{value}': {e}")))
}

/// Daily window in which heartbeats may fire, as `"HH:MM"` bounds.
///
/// `start` is inclusive and `end` exclusive. A window whose end is before
/// its start wraps past midnight (`22:00`..`06:00`); equal bounds mean the
/// whole day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveHours {
    pub start: String,
    pub end: String,
    /// IANA timezone for the bounds; UTC when unset.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl ActiveHours {
    /// Validated window in UTC.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] if either bound is not `HH:MM`.
    pub fn new(start: &str, end: &str) -> Result<Self> {
        let hours = Self {
            start: start.to_owned(),
            end: end.to_owned(),
            timezone: None,
        };
        hours.validate()?;
        Ok(hours)
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// # Errors
    ///
    /// Returns [`VigilError::Config`] for malformed bounds or an unknown timezone.
    pub fn validate(&self) -> Result<()> {
        parse_clock(&self.start)?;
        parse_clock(&self.end)?;
        if let Some(tz) = &self.timezone {
            tz.parse::<Tz>()
                .map_err(|e| VigilError::Config(format!("invalid timezone '{tz}': {e}")))?;
        }
        Ok(())
    }

    /// Whether `now` falls inside the window. Malformed windows never block.
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Ok(start), Ok(end)) = (parse_clock(&self.start), parse_clock(&self.end)) else {
            tracing::warn!(start = %self.start, end = %self.end, "ignoring malformed active hours");
            return true;
        };
        let tz = self
            .timezone
            .as_deref()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(Tz::UTC);
        let local = now.with_timezone(&tz).time();

        if start == end {
            true
        } else if start < end {
            start <= local && local < end
        } else {
            local >= start || local < end
        }
    }
}

/// Heartbeat cadence and backoff state for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSchedule {
    pub agent: String,
    pub interval_minutes: u32,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
    #[serde(default)]
    pub next_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub max_backoff_minutes: u32,
}

impl AgentSchedule {
    /// Schedule that fires on the first tick.
    pub fn new(agent: impl Into<String>, interval_minutes: u32) -> Self {
        Self {
            agent: agent.into(),
            interval_minutes: interval_minutes.max(1),
            active_hours: None,
            next_heartbeat_at: None,
            consecutive_failures: 0,
            max_backoff_minutes: DEFAULT_MAX_BACKOFF_MINUTES,
        }
    }

    pub fn with_active_hours(mut self, hours: ActiveHours) -> Self {
        self.active_hours = Some(hours);
        self
    }

    pub fn with_max_backoff_minutes(mut self, minutes: u32) -> Self {
        self.max_backoff_minutes = minutes;
        self
    }

    /// Whether a heartbeat should fire at `now`: the next slot has arrived
    /// and `now` is within active hours.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_heartbeat_at.is_none_or(|next| next <= now)
            && self.active_hours.as_ref().is_none_or(|h| h.contains(now))
    }

    /// Reset failures and schedule the next regular heartbeat.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.next_heartbeat_at = Some(now + Duration::minutes(i64::from(self.interval_minutes)));
    }

    /// Count a failure and back off: `min(interval * 2^failures, max_backoff)`.
    ///
    /// The ceiling is never below one regular interval.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let ceiling = u64::from(self.max_backoff_minutes.max(self.interval_minutes));
        let backoff = u64::from(self.interval_minutes)
            .saturating_mul(2u64.saturating_pow(self.consecutive_failures))
            .min(ceiling);
        self.next_heartbeat_at = Some(now + Duration::minutes(backoff as i64));
    }
}
