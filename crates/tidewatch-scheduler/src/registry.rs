//! Status registry: per-task run statistics and current state.
//!
//! Registration-ordered, guarded by one `RwLock`. The lock is only held for
//! bookkeeping; task bodies always run outside it.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tidewatch_core::{Result, Task, TidewatchError};

use crate::schedule::ScheduleRule;
use crate::status::TaskStatusInfo;

/// Lifecycle state of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its next due time.
    Idle,
    /// An execution is in flight.
    Running,
    /// Last run failed; still scheduled.
    Failed,
    /// Exhausted one-shot task. Never dispatched again.
    Terminal,
    Disabled,
}

impl TaskState {
    fn is_dispatchable(self) -> bool {
        matches!(self, TaskState::Idle | TaskState::Failed)
    }
}

/// How the last dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    /// Failed, and the final attempt hit the task's timeout.
    TimedOut,
}

impl RunOutcome {
    pub fn is_success(self) -> bool {
        self == RunOutcome::Succeeded
    }
}

/// Mutable run history of one task.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub state: TaskState,
    pub enabled: bool,
    pub run_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Attempts across all runs, retries included.
    pub total_attempts: u64,
    pub last_attempts: u32,
    /// Start time of the last completed dispatch.
    pub last_run_time: Option<DateTime<Utc>>,
    /// `None` once a one-shot task is exhausted.
    pub next_run_time: Option<DateTime<Utc>>,
    pub last_duration: Option<Duration>,
    pub last_outcome: Option<RunOutcome>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    fn new(next_run_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            state: if next_run_time.is_some() { TaskState::Idle } else { TaskState::Terminal },
            enabled: true,
            run_count: 0,
            success_count: 0,
            failure_count: 0,
            total_attempts: 0,
            last_attempts: 0,
            last_run_time: None,
            next_run_time,
            last_duration: None,
            last_outcome: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Success percentage, 0 when the task has never run.
    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / self.run_count.max(1) as f64 * 100.0
    }
}

/// Result of one dispatch, handed back by the execution wrapper.
#[derive(Debug, Clone)]
pub struct Completion {
    pub outcome: RunOutcome,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

/// A task marked Running by the dispatcher, ready to execute.
pub struct Claim {
    pub id: String,
    pub generation: u64,
    pub task: Arc<dyn Task>,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    id: String,
    generation: u64,
    task: Arc<dyn Task>,
    rule: ScheduleRule,
    record: RunRecord,
}

impl Entry {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.record.enabled
            && self.record.state.is_dispatchable()
            && self.record.next_run_time.is_some_and(|due| due <= now)
    }

    fn claim(&mut self, now: DateTime<Utc>) -> Claim {
        self.record.state = TaskState::Running;
        self.record.updated_at = now;
        Claim {
            id: self.id.clone(),
            generation: self.generation,
            task: Arc::clone(&self.task),
            started_at: now,
        }
    }

    fn status(&self) -> TaskStatusInfo {
        TaskStatusInfo::new(self.task.info(), &self.rule, &self.record)
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<Entry>,
    next_generation: u64,
}

/// Thread-safe map from task id to its task, rule and run record.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking task never runs under this lock, so poisoning only means a
    // bookkeeping write was interrupted; the data is still usable.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a task. The registry is unchanged on error.
    pub fn insert(&self, task: Arc<dyn Task>, rule: ScheduleRule, now: DateTime<Utc>) -> Result<()> {
        rule.validate()?;
        let mut inner = self.write();
        let id = task.id().to_string();
        if inner.entries.iter().any(|e| e.id == id) {
            return Err(TidewatchError::DuplicateTask(id));
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let record = RunRecord::new(rule.first_due(now), now);
        inner.entries.push(Entry {
            id,
            generation,
            task,
            rule,
            record,
        });
        Ok(())
    }

    /// Drop a task. An in-flight run keeps going; its result is discarded.
    pub fn remove(&self, id: &str) -> Result<Arc<dyn Task>> {
        let mut inner = self.write();
        let pos = inner
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| TidewatchError::UnknownTask(id.to_string()))?;
        Ok(inner.entries.remove(pos).task)
    }

    /// Claim every due task in registration order.
    ///
    /// `reserve` is asked for a worker slot before each claim; the scan stops
    /// at the first `None` so the remaining tasks stay due for the next pass.
    pub fn claim_due<S>(
        &self,
        now: DateTime<Utc>,
        mut reserve: impl FnMut() -> Option<S>,
    ) -> Vec<(Claim, S)> {
        let mut inner = self.write();
        let mut claimed = Vec::new();
        for entry in inner.entries.iter_mut().filter(|e| e.is_due(now)) {
            let Some(slot) = reserve() else {
                break;
            };
            claimed.push((entry.claim(now), slot));
        }
        claimed
    }

    /// Claim one task regardless of its due time.
    ///
    /// `Ok(None)` when the task is not dispatchable (running, disabled,
    /// exhausted) or `reserve` yields no slot.
    pub fn claim<S>(
        &self,
        id: &str,
        now: DateTime<Utc>,
        reserve: impl FnOnce() -> Option<S>,
    ) -> Result<Option<(Claim, S)>> {
        let mut inner = self.write();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| TidewatchError::UnknownTask(id.to_string()))?;
        if !entry.record.enabled || !entry.record.state.is_dispatchable() {
            return Ok(None);
        }
        Ok(reserve().map(|slot| (entry.claim(now), slot)))
    }

    /// Write back the result of a claimed run.
    ///
    /// Returns `false` when the claimed entry is gone (removed, or removed and
    /// re-added under the same id); the result is then discarded.
    pub fn complete(&self, claim: &Claim, done: Completion, finished_at: DateTime<Utc>) -> bool {
        let mut inner = self.write();
        let Some(entry) = inner
            .entries
            .iter_mut()
            .find(|e| e.id == claim.id && e.generation == claim.generation)
        else {
            return false;
        };

        let rec = &mut entry.record;
        rec.run_count += 1;
        rec.total_attempts += u64::from(done.attempts);
        rec.last_attempts = done.attempts;
        rec.last_run_time = Some(claim.started_at);
        rec.last_duration = Some(done.duration);
        rec.last_outcome = Some(done.outcome);
        if done.outcome.is_success() {
            rec.success_count += 1;
            rec.last_error = None;
        } else {
            rec.failure_count += 1;
            rec.last_error = done.error;
        }

        rec.next_run_time = entry.rule.next_due(Some(claim.started_at), finished_at);
        rec.state = match rec.next_run_time {
            None => TaskState::Terminal,
            Some(_) if !rec.enabled => TaskState::Disabled,
            Some(_) if done.outcome.is_success() => TaskState::Idle,
            Some(_) => TaskState::Failed,
        };
        rec.updated_at = finished_at;
        true
    }

    /// Enable or disable a task. A running task finishes its current run.
    pub fn set_enabled(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.write();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| TidewatchError::UnknownTask(id.to_string()))?;
        let rec = &mut entry.record;
        rec.enabled = enabled;
        rec.state = match (rec.state, enabled) {
            (TaskState::Running | TaskState::Terminal, _) => rec.state,
            (_, false) => TaskState::Disabled,
            (TaskState::Disabled, true) => TaskState::Idle,
            (state, true) => state,
        };
        rec.updated_at = now;
        Ok(())
    }

    pub fn snapshot(&self, id: &str) -> Result<TaskStatusInfo> {
        self.read()
            .entries
            .iter()
            .find(|e| e.id == id)
            .map(Entry::status)
            .ok_or_else(|| TidewatchError::UnknownTask(id.to_string()))
    }

    /// Status of every task, in registration order.
    pub fn snapshot_all(&self) -> Vec<TaskStatusInfo> {
        self.read().entries.iter().map(Entry::status).collect()
    }

    pub fn count(&self) -> usize {
        self.read().entries.len()
    }

    /// Every registered task, in registration order.
    pub fn tasks(&self) -> Vec<Arc<dyn Task>> {
        self.read().entries.iter().map(|e| Arc::clone(&e.task)).collect()
    }
}
