//! Events yielded by an orchestrated turn.

use serde::{Deserialize, Serialize};

/// Stable error codes carried by terminal `turn_error` events.
pub mod error_codes {
    /// Transient errors persisted through every attempt.
    pub const TRANSIENT_EXHAUSTED: &str = "TRANSIENT_EXHAUSTED";
    /// The agent reported an error that retrying cannot fix.
    pub const PERMANENT_FAILURE: &str = "PERMANENT_FAILURE";
    /// The agent failed with an unclassified error.
    pub const EXECUTION_FAILED: &str = "EXECUTION_FAILED";
    /// More tool calls than the policy allows.
    pub const TOOL_BUDGET_EXCEEDED: &str = "TOOL_BUDGET_EXCEEDED";
    /// One failure signature kept recurring.
    pub const REPEATED_FAILURE: &str = "REPEATED_FAILURE";
    /// Too many failed tool outputs overall.
    pub const FAILED_OUTPUT_LIMIT: &str = "FAILED_OUTPUT_LIMIT";
    /// The same tool intent kept recurring.
    pub const REPEATED_INTENT: &str = "REPEATED_INTENT";
    /// The turn was cancelled.
    pub const CANCELLED: &str = "CANCELLED";
}

/// Why a turn ended in error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorKind {
    TransientExhausted,
    Permanent,
    Execution,
    ToolBudgetExceeded,
    RepeatedFailure,
    FailedOutputLimit,
    RepeatedIntent,
    Cancelled,
}

impl TurnErrorKind {
    /// Stable code for this kind.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::TransientExhausted => error_codes::TRANSIENT_EXHAUSTED,
            Self::Permanent => error_codes::PERMANENT_FAILURE,
            Self::Execution => error_codes::EXECUTION_FAILED,
            Self::ToolBudgetExceeded => error_codes::TOOL_BUDGET_EXCEEDED,
            Self::RepeatedFailure => error_codes::REPEATED_FAILURE,
            Self::FailedOutputLimit => error_codes::FAILED_OUTPUT_LIMIT,
            Self::RepeatedIntent => error_codes::REPEATED_INTENT,
            Self::Cancelled => error_codes::CANCELLED,
        }
    }

    /// Whether a policy circuit breaker (rather than the agent) ended the turn.
    #[must_use]
    pub fn is_policy(self) -> bool {
        matches!(
            self,
            Self::ToolBudgetExceeded
                | Self::RepeatedFailure
                | Self::FailedOutputLimit
                | Self::RepeatedIntent
        )
    }
}

/// Bounded rendering of a possibly large text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub text: String,
    pub truncated: bool,
    /// Size of the original text in characters.
    pub original_chars: usize,
}

/// Counters accumulated over a turn, across attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCounters {
    /// Agent invocations so far.
    pub attempts: u32,
    /// Budgeted tool/skill calls.
    pub tool_call_count: u32,
    /// Calls to budget-exempt tools.
    pub exempt_tool_calls: u32,
    pub failed_tool_outputs: u32,
    /// Characters of model text in the final answer.
    pub answer_chars: usize,
}

/// One event of an orchestrated turn.
///
/// Exactly one terminal event (`TurnComplete` or `TurnError`) ends every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    LlmDelta {
        text: String,
    },
    ToolCall {
        name: String,
        arguments: Preview,
        skill: bool,
        exempt: bool,
    },
    ToolOutput {
        name: String,
        output: Preview,
        /// Set when the output looks like a failure.
        failure_signature: Option<String>,
    },
    Status {
        message: String,
        attempt: u32,
    },
    TurnComplete {
        answer: String,
        counters: TurnCounters,
    },
    TurnError {
        kind: TurnErrorKind,
        code: String,
        message: String,
        counters: TurnCounters,
    },
}

impl TurnEvent {
    /// Whether this event ends the turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. } | Self::TurnError { .. })
    }

    pub(crate) fn error(kind: TurnErrorKind, message: impl Into<String>, counters: TurnCounters) -> Self {
        Self::TurnError {
            kind,
            code: kind.code().to_owned(),
            message: message.into(),
            counters,
        }
    }
}
