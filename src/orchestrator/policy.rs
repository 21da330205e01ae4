//! Turn policy: retry, budgets and circuit-breaker thresholds.

use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Retry jitter is at most `1 / JITTER_DIVISOR` of the delay.
const JITTER_DIVISOR: u32 = 10;

/// How an agent error should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying (rate limits, overload, network blips).
    Transient,
    /// Will not succeed on retry (auth, quota, malformed request).
    Permanent,
    /// Anything else: not retried.
    Execution,
}

/// Limits applied to one orchestrated turn.
///
/// Loaded from the `[turn]` config section; every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnPolicy {
    /// Total agent invocations per turn, including the first.
    pub max_attempts: u32,
    /// Tool/skill calls allowed per turn (exempt tools excluded).
    pub max_tool_calls: u32,
    /// Failed tool outputs tolerated per turn.
    pub max_failed_tool_outputs: u32,
    /// Occurrences of one failure signature that abort the turn.
    pub max_same_failure_signature: u32,
    /// Repeats of one tool intent tolerated per turn.
    pub max_same_tool_intent: u32,
    /// Per-attempt timeout in seconds.
    pub timeout_secs: u64,
    /// Case-insensitive markers for transient errors. Numeric markers
    /// (status codes) match whole words only; others match as substrings.
    pub transient_markers: Vec<String>,
    /// Case-insensitive substrings marking an error as permanent.
    /// Checked before the transient markers.
    pub permanent_markers: Vec<String>,
    /// Tool names that do not count toward `max_tool_calls`.
    pub exempt_tools: BTreeSet<String>,
    /// First retry delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Characters kept from the start of oversized previews.
    pub preview_head_chars: usize,
    /// Characters kept from the end of oversized previews.
    pub preview_tail_chars: usize,
}

impl Default for TurnPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_tool_calls: 40,
            max_failed_tool_outputs: 8,
            max_same_failure_signature: 3,
            max_same_tool_intent: 4,
            timeout_secs: 600,
            transient_markers: [
                "timeout",
                "timed out",
                "rate limit",
                "429",
                "500",
                "502",
                "503",
                "504",
                "overloaded",
                "temporarily unavailable",
                "connection reset",
                "connection refused",
                "disconnect",
                "econnreset",
            ]
            .map(str::to_owned)
            .to_vec(),
            permanent_markers: [
                "401",
                "403",
                "unauthorized",
                "forbidden",
                "invalid api key",
                "authentication",
                "quota",
                "billing",
                "insufficient_quota",
                "invalid_request",
            ]
            .map(str::to_owned)
            .to_vec(),
            exempt_tools: BTreeSet::new(),
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 16_000,
            preview_head_chars: 1_200,
            preview_tail_chars: 400,
        }
    }
}

impl TurnPolicy {
    /// Per-attempt timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Add names to the budget-exempt set.
    pub fn with_exempt_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exempt_tools.extend(names.into_iter().map(Into::into));
        self
    }

    /// Whether calls to `tool` skip the budget.
    #[must_use]
    pub fn is_exempt(&self, tool: &str) -> bool {
        self.exempt_tools.contains(tool)
    }

    /// Classify an error message by marker.
    #[must_use]
    pub fn classify(&self, message: &str) -> ErrorClass {
        let lower = message.to_lowercase();
        let matches = |markers: &[String]| markers.iter().any(|m| marker_matches(&lower, m));
        if matches(&self.permanent_markers) {
            ErrorClass::Permanent
        } else if matches(&self.transient_markers) {
            ErrorClass::Transient
        } else {
            ErrorClass::Execution
        }
    }

    /// Backoff before retry number `attempt` (1-indexed).
    ///
    /// `min(base * 2^(attempt-1), max)` plus up to 10% jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay = self.base_delay_ms(attempt) as f64;
        let jitter = delay * (rand::random::<f64>() / f64::from(JITTER_DIVISOR));
        Duration::from_millis((delay + jitter) as u64)
    }

    fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exp = 1u64 << attempt.saturating_sub(1).min(30);
        self.retry_base_delay_ms
            .saturating_mul(exp)
            .min(self.retry_max_delay_ms)
    }

    /// Longest a turn may run when every attempt times out after
    /// `attempt_timeout`, backoff sleeps at their jitter ceiling included.
    #[must_use]
    pub fn max_turn_duration(&self, attempt_timeout: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff_ms = (1..attempts)
            .map(|attempt| {
                let delay = self.base_delay_ms(attempt);
                delay.saturating_add(delay.div_ceil(u64::from(JITTER_DIVISOR)))
            })
            .fold(0u64, u64::saturating_add);
        attempt_timeout
            .saturating_mul(attempts)
            .saturating_add(Duration::from_millis(backoff_ms))
    }
}

/// Whether `marker` occurs in the lowercased `message`.
fn marker_matches(message: &str, marker: &str) -> bool {
    let marker = marker.trim().to_lowercase();
    if marker.is_empty() {
        return false;
    }
    if !marker.bytes().all(|b| b.is_ascii_digit()) {
        return message.contains(&marker);
    }
    // Status codes: "HTTP 500" matches, "processed 1500 rows" does not.
    Regex::new(&format!(r"\b{}\b", regex::escape(&marker)))
        .map(|re| re.is_match(message))
        .unwrap_or(false)
}
