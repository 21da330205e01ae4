//! Vigil: keep-alive engine for long-lived conversational agents.
//!
//! Agents are woken on a heartbeat, work through scheduled tasks kept in a
//! human-editable document, and leave anything worth the user's attention
//! in a durable mailbox. Conversation state survives crashes.
//!
//! # Architecture
//!
//! - **Scheduler** ([`scheduler`]): per-agent heartbeat cadence with
//!   failure backoff, active hours and crash-resume state
//! - **Heartbeat runner** ([`heartbeat`]): classifies each tick and drives
//!   the agent through the right turn
//! - **Turn orchestrator** ([`orchestrator`]): retries, tool budgets and
//!   circuit breakers around a single turn
//! - **Task manager** ([`tasks`]): the task block, its state machine and
//!   schedule evaluation
//! - **Session store and mailbox** ([`session`]): checksummed, locked,
//!   atomically written session records
//! - **Agents** ([`agent`]): the runtime seam, plus a JSON-lines
//!   subprocess implementation

pub mod agent;
pub mod bus;
pub mod capability;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod observability;
pub mod orchestrator;
pub mod persist;
pub mod scheduler;
pub mod session;
pub mod tasks;
pub mod vigil_dirs;

pub use config::VigilConfig;
pub use error::{Result, VigilError};
pub use heartbeat::{AgentBinding, HeartbeatRunner};
pub use scheduler::Scheduler;
pub use session::{FsSessionStore, Mailbox};
