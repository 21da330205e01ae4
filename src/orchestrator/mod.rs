//! Turn orchestration: retry, tool budgets and circuit breakers around a
//! single agent turn.

pub mod engine;
pub mod events;
pub mod policy;
pub mod preview;
pub mod signature;

pub use engine::{TurnEventStream, TurnOrchestrator, TurnOutcome};
pub use events::{Preview, TurnCounters, TurnErrorKind, TurnEvent, error_codes};
pub use policy::{ErrorClass, TurnPolicy};
pub use preview::{bounded_preview, json_preview};
pub use signature::{failure_signature, intent_signature};
