//! Unified error types for Tidewatch.
//!
//! These are the errors a caller of the scheduler API can see. Failures of a
//! task body are a different thing: see [`crate::task::TaskFailure`], which is
//! recorded in the task's run statistics and never returned to the caller.

use thiserror::Error;

/// Result type alias using TidewatchError.
pub type Result<T> = std::result::Result<T, TidewatchError>;

#[derive(Error, Debug)]
pub enum TidewatchError {
    // Registry errors
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    UnknownTask(String),

    // Lifecycle errors
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TidewatchError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_schedule(msg: impl Into<String>) -> Self {
        Self::InvalidSchedule(msg.into())
    }
}
