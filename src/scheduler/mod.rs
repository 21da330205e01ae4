//! Heartbeat and task scheduler.
//!
//! Decides when each agent's heartbeat fires (with failure backoff and
//! active hours) and dispatches due tasks through injected callbacks.

pub mod runner;
pub mod schedule;
pub mod state;

pub use runner::{
    DueTask, HeartbeatOutcome, Scheduler, SchedulerCallbacks, SkipReason, TickReport,
};
pub use schedule::{ActiveHours, AgentSchedule};
pub use state::{AgentScheduleState, SchedulerState};
