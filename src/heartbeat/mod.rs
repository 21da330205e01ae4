//! Heartbeat Runner: turns scheduler ticks into agent turns.
//!
//! - [`classify`]: what a tick should do, from the task document
//! - [`delivery`]: acknowledgement suppression
//! - [`prompt`]: prompts for each kind of turn
//! - [`runner`]: [`HeartbeatRunner`], the [`SchedulerCallbacks`](crate::scheduler::SchedulerCallbacks) implementation

pub mod classify;
pub mod delivery;
pub mod prompt;
pub mod runner;

pub use classify::{TickKind, classify_tick, reflection_due};
pub use delivery::{DEFAULT_ACK_MAX_REMAINDER, DEFAULT_ACK_TOKEN, Delivery, decide};
pub use runner::{AgentBinding, HeartbeatRunner, HeartbeatSettings, LAST_REFLECTION_VAR};
