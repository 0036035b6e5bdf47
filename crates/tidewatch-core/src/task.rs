//! The task contract: the one thing the scheduler knows about a unit of work.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a task: unique id, display name, free-text description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl TaskInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Why an execution attempt failed.
///
/// Task bodies return these; the scheduler records them as `last_error` and
/// never propagates them to its caller.
#[derive(Debug, Error)]
pub enum TaskFailure {
    /// The body ran to completion but reported `false`.
    #[error("task reported failure")]
    Reported,

    #[error("{0}")]
    Message(String),

    #[error("process exited with {}: {stderr}", exit_label(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task panicked: {0}")]
    Panicked(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "signal".to_string(),
    }
}

impl TaskFailure {
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<std::io::Error> for TaskFailure {
    fn from(e: std::io::Error) -> Self {
        Self::Message(format!("IO error: {e}"))
    }
}

impl From<String> for TaskFailure {
    fn from(msg: String) -> Self {
        Self::Message(msg)
    }
}

impl From<&str> for TaskFailure {
    fn from(msg: &str) -> Self {
        Self::Message(msg.to_string())
    }
}

/// A schedulable unit of work.
///
/// `execute` takes nothing beyond what the implementor bound at construction.
/// It may be called from any worker thread, one call at a time per registered
/// task. `Ok(false)`, `Err(_)` and a panic inside the body are all recorded as
/// a failed run.
#[async_trait]
pub trait Task: Send + Sync {
    /// Identity of this task.
    fn info(&self) -> &TaskInfo;

    /// Run the task body once.
    async fn execute(&self) -> Result<bool, TaskFailure>;

    fn id(&self) -> &str {
        &self.info().id
    }

    fn name(&self) -> &str {
        &self.info().name
    }

    fn description(&self) -> &str {
        &self.info().description
    }

    /// Release whatever the task keeps open between runs (sensor streams,
    /// helper services). Called once per registered task when a running
    /// scheduler stops, after in-flight runs had their grace period.
    async fn on_stop(&self) -> Result<(), TaskFailure> {
        Ok(())
    }
}
