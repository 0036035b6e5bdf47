//! # Tidewatch Core
//!
//! Shared building blocks for the Tidewatch scheduler:
//! - [`error`]: API error type and `Result` alias
//! - [`config`]: TOML configuration (engine settings, logging, task list)
//! - [`task`]: the [`Task`] execution contract every unit of work implements

pub mod config;
pub mod error;
pub mod task;

pub use config::{LoggingConfig, MAX_WORKERS, ScheduleConfig, SchedulerConfig, TaskConfig, TidewatchConfig};
pub use error::{Result, TidewatchError};
pub use task::{Task, TaskFailure, TaskInfo};
