//! Span names and field keys for structured tracing.
//!
//! Spans follow the hierarchy:
//!
//! ```text
//! vigil.scheduler.tick
//!   └─> vigil.heartbeat.run
//!        └─> vigil.turn
//! vigil.session.operation (parallel to turn spans)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tracing::info_span;
//! use vigil::observability::*;
//!
//! let span = info_span!(SPAN_HEARTBEAT_RUN, { FIELD_AGENT } = "ada");
//! let _enter = span.enter();
//! ```

/// One iteration of the scheduler loop.
pub const SPAN_SCHEDULER_TICK: &str = "vigil.scheduler.tick";

/// One heartbeat for one agent (child of a scheduler tick).
pub const SPAN_HEARTBEAT_RUN: &str = "vigil.heartbeat.run";

/// One orchestrated conversational turn.
pub const SPAN_TURN: &str = "vigil.turn";

/// Session store mutation or load.
pub const SPAN_SESSION_OPERATION: &str = "vigil.session.operation";

/// Agent name field.
pub const FIELD_AGENT: &str = "agent";

/// Session id field.
pub const FIELD_SESSION_ID: &str = "session_id";

/// Task id field.
pub const FIELD_TASK_ID: &str = "task_id";

/// Retry attempt field (1-indexed).
pub const FIELD_ATTEMPT: &str = "attempt";

/// Session operation name ("mutate", "load", "lease").
pub const FIELD_OPERATION: &str = "operation";
