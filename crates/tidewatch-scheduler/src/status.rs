//! Status snapshots returned by the control API. All serde-serializable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tidewatch_core::TaskInfo;

use crate::pool::PoolStats;
use crate::registry::{RunOutcome, RunRecord, TaskState};
use crate::schedule::{ScheduleRule, ScheduleType};

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: TaskState,
    pub enabled: bool,
    /// Human-readable rule, e.g. `every 30.0s`.
    pub schedule: String,
    pub schedule_type: ScheduleType,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Percent, 0.0 to 100.0.
    pub success_rate: f64,
    pub total_attempts: u64,
    pub last_attempts: u32,
    pub last_run_time: Option<DateTime<Utc>>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_outcome: Option<RunOutcome>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatusInfo {
    pub(crate) fn new(info: &TaskInfo, rule: &ScheduleRule, record: &RunRecord) -> Self {
        Self {
            id: info.id.clone(),
            name: info.name.clone(),
            description: info.description.clone(),
            state: record.state,
            enabled: record.enabled,
            schedule: rule.to_string(),
            schedule_type: rule.schedule_type(),
            run_count: record.run_count,
            success_count: record.success_count,
            failure_count: record.failure_count,
            success_rate: record.success_rate(),
            total_attempts: record.total_attempts,
            last_attempts: record.last_attempts,
            last_run_time: record.last_run_time,
            next_run_time: record.next_run_time,
            last_duration_ms: record
                .last_duration
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            last_outcome: record.last_outcome,
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Aggregate view of the whole scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Whether the dispatch loop is running.
    pub scheduler_status: bool,
    pub total_tasks: usize,
    pub running_tasks: usize,
    pub pool: PoolStats,
    pub tasks: BTreeMap<String, TaskStatusInfo>,
}

impl SchedulerStatus {
    pub(crate) fn new(running: bool, pool: PoolStats, tasks: Vec<TaskStatusInfo>) -> Self {
        let running_tasks = tasks
            .iter()
            .filter(|t| t.state == TaskState::Running)
            .count();
        Self {
            scheduler_status: running,
            total_tasks: tasks.len(),
            running_tasks,
            pool,
            tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// One log-friendly line, e.g. `running, 3 tasks (1 running), 1/4 workers`.
    pub fn summary(&self) -> String {
        format!(
            "{}, {} tasks ({} running), {}/{} workers",
            if self.scheduler_status { "running" } else { "stopped" },
            self.total_tasks,
            self.running_tasks,
            self.pool.active,
            self.pool.max_workers
        )
    }
}

/// What `get_task_status` returns: everything, or a single task.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusSnapshot {
    Scheduler(SchedulerStatus),
    Task(TaskStatusInfo),
}

impl StatusSnapshot {
    pub fn as_scheduler(&self) -> Option<&SchedulerStatus> {
        match self {
            StatusSnapshot::Scheduler(s) => Some(s),
            StatusSnapshot::Task(_) => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskStatusInfo> {
        match self {
            StatusSnapshot::Task(t) => Some(t),
            StatusSnapshot::Scheduler(_) => None,
        }
    }
}
