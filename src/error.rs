//! Error types for the vigil engine.

/// Top-level error type for the keep-alive engine.
#[derive(Debug, thiserror::Error)]
pub enum VigilError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Task document could not be read or written.
    #[error("task document error: {0}")]
    TaskDocument(String),

    /// Schedule expression could not be evaluated.
    #[error("schedule error: {0}")]
    Schedule(String),

    /// A task state transition that the state machine does not allow.
    #[error("invalid task transition: {0}")]
    InvalidTransition(String),

    /// Session persistence error.
    #[error("session error: {0}")]
    Session(String),

    /// Lock file could not be created or inspected.
    #[error("lock error: {0}")]
    Lock(String),

    /// Scheduler error (state persistence, dispatch).
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// Agent runtime error surfaced outside a turn.
    #[error("agent error: {0}")]
    Agent(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VigilError>;
