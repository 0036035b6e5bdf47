//! # Tidewatch Scheduler
//!
//! Embeddable task scheduler for periodic data-collection jobs.
//!
//! ## Design Principles
//! - One dispatcher, one bounded worker pool: never more than `max_workers`
//!   task bodies in flight
//! - Tokio timers only, so the scheduler costs nothing while idle
//! - Task failures stay inside the scheduler and show up in status snapshots
//! - No persistence: schedules live as long as the scheduler instance
//!
//! ## Architecture
//! ```text
//! TaskScheduler (tokio interval, poll_interval)
//!   ├── Registry: id → (Task, ScheduleRule, RunRecord)
//!   │     ├── IntervalTask: every 30s → "heart_beat.py"
//!   │     └── OnceTask: 2026-03-01T02:00Z → "calibrate.sh"
//!   ├── due tasks → WorkerPool (semaphore, max_workers)
//!   │                 └── retry loop: Attempt → Success | Retry → Failed
//!   └── write-back → counters, last_error, next_run_time
//! ```

pub mod engine;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod status;
pub mod tasks;

pub use engine::TaskScheduler;
pub use pool::{PoolStats, WorkerPool};
pub use registry::{RunOutcome, RunRecord, TaskState};
pub use retry::{ExecutionReport, RetryPolicy};
pub use schedule::{ScheduleRule, ScheduleType};
pub use status::{SchedulerStatus, StatusSnapshot, TaskStatusInfo};
pub use tasks::{FunctionTask, ScriptTask, TaskArgs};

pub use tidewatch_core::{Result, SchedulerConfig, Task, TaskFailure, TaskInfo, TidewatchError};
