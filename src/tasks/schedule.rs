//! Next-run computation for task schedules.
//!
//! A schedule string is handed to the first registered [`ScheduleEvaluator`]
//! that accepts it. Interval strings (`"45s"`, `"30m"`, `"1h"`, `"2d"`,
//! `"1w"`) are always understood; cron expressions are understood when the
//! `cron-schedules` feature is enabled (the default).
//!
//! # Examples
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use vigil::tasks::schedule::ScheduleEngine;
//!
//! let engine = ScheduleEngine::default();
//! let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
//! let next = engine.next_run("30m", None, now).unwrap();
//! assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 30, 0).unwrap());
//! ```

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::error::{Result, VigilError};

/// Computes the next occurrence of one family of schedule expressions.
pub trait ScheduleEvaluator: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Whether this evaluator understands `expr`.
    fn accepts(&self, expr: &str) -> bool;

    /// First occurrence strictly after `after`, evaluated in `tz`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Schedule`] when `expr` is malformed or has no
    /// future occurrence.
    fn next_after(&self, expr: &str, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>>;
}

/// Parse an interval string such as `"30m"` into a duration.
///
/// Accepted units: `s`, `m`, `h`, `d`, `w`. The amount must be positive.
///
/// # Errors
///
/// Returns [`VigilError::Schedule`] on an unknown unit, a missing or zero
/// amount, or overflow.
pub fn parse_interval(expr: &str) -> Result<Duration> {
    let expr = expr.trim();
    let invalid = || VigilError::Schedule(format!("invalid interval '{expr}'"));
    let unit = expr.chars().last().ok_or_else(invalid)?;
    let amount: i64 = expr[..expr.len() - unit.len_utf8()]
        .trim()
        .parse()
        .map_err(|_| invalid())?;
    if amount <= 0 {
        return Err(invalid());
    }
    let duration = match unit.to_ascii_lowercase() {
        's' => Duration::try_seconds(amount),
        'm' => Duration::try_minutes(amount),
        'h' => Duration::try_hours(amount),
        'd' => Duration::try_days(amount),
        'w' => Duration::try_weeks(amount),
        _ => None,
    };
    duration.ok_or_else(invalid)
}

/// Fixed-interval schedules: next run is `after + interval`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalEvaluator;

impl ScheduleEvaluator for IntervalEvaluator {
    fn name(&self) -> &'static str {
        "interval"
    }

    fn accepts(&self, expr: &str) -> bool {
        parse_interval(expr).is_ok()
    }

    fn next_after(&self, expr: &str, after: DateTime<Utc>, _tz: Tz) -> Result<DateTime<Utc>> {
        let interval = parse_interval(expr)?;
        after
            .checked_add_signed(interval)
            .ok_or_else(|| VigilError::Schedule(format!("interval '{expr}' overflows")))
    }
}

/// Cron schedules with 5 (minute precision), 6 or 7 fields.
#[cfg(feature = "cron-schedules")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CronEvaluator;

#[cfg(feature = "cron-schedules")]
impl CronEvaluator {
    /// The `cron` crate wants a leading seconds field; classic 5-field
    /// expressions get `0` prepended.
    fn normalize(expr: &str) -> String {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() == 5 {
            format!("0 {}", fields.join(" "))
        } else {
            fields.join(" ")
        }
    }

    fn parse(expr: &str) -> Result<cron::Schedule> {
        use std::str::FromStr;
        cron::Schedule::from_str(&Self::normalize(expr))
            .map_err(|e| VigilError::Schedule(format!("invalid cron expression '{expr}': {e}")))
    }
}

#[cfg(feature = "cron-schedules")]
impl ScheduleEvaluator for CronEvaluator {
    fn name(&self) -> &'static str {
        "cron"
    }

    fn accepts(&self, expr: &str) -> bool {
        let fields = expr.split_whitespace().count();
        (5..=7).contains(&fields)
    }

    fn next_after(&self, expr: &str, after: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
        let schedule = Self::parse(expr)?;
        schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Utc))
            .ok_or_else(|| VigilError::Schedule(format!("cron '{expr}' has no future occurrence")))
    }
}

/// Ordered set of evaluators consulted for every schedule.
#[derive(Clone)]
pub struct ScheduleEngine {
    evaluators: Vec<Arc<dyn ScheduleEvaluator>>,
}

impl Default for ScheduleEngine {
    /// Interval evaluator plus, when compiled in, the cron evaluator.
    fn default() -> Self {
        let engine = Self::interval_only();
        #[cfg(feature = "cron-schedules")]
        let engine = engine.with_evaluator(Arc::new(CronEvaluator));
        engine
    }
}

impl std::fmt::Debug for ScheduleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.evaluators.iter().map(|e| e.name()).collect();
        f.debug_struct("ScheduleEngine")
            .field("evaluators", &names)
            .finish()
    }
}

impl ScheduleEngine {
    /// Engine that only understands interval strings.
    pub fn interval_only() -> Self {
        Self {
            evaluators: vec![Arc::new(IntervalEvaluator)],
        }
    }

    /// Register an additional evaluator, consulted after the existing ones.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ScheduleEvaluator>) -> Self {
        self.evaluators.push(evaluator);
        self
    }

    /// Check that `schedule` is understood and has a next occurrence.
    ///
    /// # Errors
    ///
    /// Same as [`ScheduleEngine::next_run`].
    pub fn validate(&self, schedule: &str, timezone: Option<&str>) -> Result<()> {
        self.next_run(schedule, timezone, Utc::now()).map(|_| ())
    }

    /// Next occurrence of `schedule` strictly after `after`.
    ///
    /// An unknown `timezone` falls back to UTC with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Schedule`] when no evaluator accepts the
    /// expression or the accepting evaluator rejects it.
    pub fn next_run(
        &self,
        schedule: &str,
        timezone: Option<&str>,
        after: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let tz = resolve_timezone(timezone);
        let evaluator = self
            .evaluators
            .iter()
            .find(|e| e.accepts(schedule))
            .ok_or_else(|| {
                VigilError::Schedule(format!("no evaluator understands schedule '{schedule}'"))
            })?;
        evaluator.next_after(schedule, after, tz)
    }
}

fn resolve_timezone(timezone: Option<&str>) -> Tz {
    match timezone.map(str::trim).filter(|t| !t.is_empty()) {
        None => Tz::UTC,
        Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!(timezone = name, "unknown timezone, evaluating schedule in UTC");
            Tz::UTC
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn parses_interval_units() {
        assert_eq!(parse_interval("45s").unwrap(), Duration::seconds(45));
        assert_eq!(parse_interval("30m").unwrap(), Duration::minutes(30));
        assert_eq!(parse_interval("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_interval("2d").unwrap(), Duration::days(2));
        assert_eq!(parse_interval("1w").unwrap(), Duration::weeks(1));
        assert_eq!(parse_interval(" 15M ").unwrap(), Duration::minutes(15));
    }

    #[test]
    fn rejects_bad_intervals() {
        for bad in ["", "m", "0m", "-5m", "5x", "abc", "1.5h"] {
            assert!(parse_interval(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn interval_next_run_adds_duration() {
        let engine = ScheduleEngine::interval_only();
        assert_eq!(engine.next_run("2h", None, at(9, 0)).unwrap(), at(11, 0));
    }

    #[test]
    fn interval_only_engine_rejects_cron() {
        let engine = ScheduleEngine::interval_only();
        assert!(engine.next_run("0 9 * * *", None, at(8, 0)).is_err());
    }

    #[cfg(feature = "cron-schedules")]
    #[test]
    fn five_field_cron_in_utc() {
        let engine = ScheduleEngine::default();
        let next = engine.next_run("0 9 * * *", None, at(8, 0)).unwrap();
        assert_eq!(next, at(9, 0));
        let after_nine = engine.next_run("0 9 * * *", None, at(9, 0)).unwrap();
        assert_eq!(after_nine, at(9, 0) + Duration::days(1));
    }

    #[cfg(feature = "cron-schedules")]
    #[test]
    fn cron_honours_timezone() {
        let engine = ScheduleEngine::default();
        // 09:00 in Berlin during CET (UTC+1) is 08:00 UTC.
        let next = engine
            .next_run("0 9 * * *", Some("Europe/Berlin"), at(6, 0))
            .unwrap();
        assert_eq!(next, at(8, 0));
    }

    #[cfg(feature = "cron-schedules")]
    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let engine = ScheduleEngine::default();
        let next = engine
            .next_run("0 9 * * *", Some("Mars/Olympus"), at(6, 0))
            .unwrap();
        assert_eq!(next, at(9, 0));
    }

    #[cfg(feature = "cron-schedules")]
    #[test]
    fn malformed_cron_is_an_error() {
        let engine = ScheduleEngine::default();
        assert!(engine.validate("99 99 * * *", None).is_err());
    }

    #[test]
    fn custom_evaluator_is_consulted() {
        struct Hourly;
        impl ScheduleEvaluator for Hourly {
            fn name(&self) -> &'static str {
                "hourly"
            }
            fn accepts(&self, expr: &str) -> bool {
                expr == "@hourly"
            }
            fn next_after(&self, _: &str, after: DateTime<Utc>, _: Tz) -> Result<DateTime<Utc>> {
                Ok(after + Duration::hours(1))
            }
        }

        let engine = ScheduleEngine::interval_only().with_evaluator(Arc::new(Hourly));
        assert_eq!(engine.next_run("@hourly", None, at(1, 0)).unwrap(), at(2, 0));
        assert!(format!("{engine:?}").contains("hourly"));
    }
}
