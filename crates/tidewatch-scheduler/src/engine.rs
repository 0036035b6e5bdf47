//! Scheduler engine: the dispatch loop and the control API around it.
//!
//! The dispatcher wakes every `poll_interval`, claims due tasks in
//! registration order while worker slots are free, and hands each to a
//! worker. Workers run the retry loop and write the result back into the
//! registry. Nothing here holds a lock while a task body runs.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tidewatch_core::{Result, SchedulerConfig, Task, TaskConfig, TidewatchError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pool::{WorkerPool, WorkerSlot};
use crate::registry::{Claim, Completion, Registry};
use crate::retry::{self, RetryPolicy};
use crate::schedule::ScheduleRule;
use crate::status::{SchedulerStatus, StatusSnapshot, TaskStatusInfo};
use crate::tasks::{ScriptTask, panic_message};

/// State shared between the API, the dispatcher and the workers.
struct Shared {
    config: SchedulerConfig,
    registry: Registry,
    pool: WorkerPool,
    retry: RetryPolicy,
}

/// Present while the dispatch loop runs.
struct Dispatcher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Interval/one-shot task scheduler with a bounded worker pool.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl TaskScheduler {
    /// Create a stopped scheduler. Fails on an invalid config.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(config.max_workers);
        let retry = RetryPolicy::from_config(&config);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                registry: Registry::new(),
                pool,
                retry,
            }),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    fn dispatcher(&self) -> MutexGuard<'_, Option<Dispatcher>> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a task under its own id.
    pub fn add_task<T: Task + 'static>(&self, task: T, rule: ScheduleRule) -> Result<()> {
        self.add_shared_task(Arc::new(task), rule)
    }

    pub fn add_shared_task(&self, task: Arc<dyn Task>, rule: ScheduleRule) -> Result<()> {
        let (id, name) = (task.id().to_string(), task.name().to_string());
        let summary = rule.to_string();
        self.shared.registry.insert(task, rule, Utc::now())?;
        tracing::info!("📅 Task added: '{}' ({}), {}", name, id, summary);
        Ok(())
    }

    /// Register a script task described in the config file.
    pub fn add_configured_task(&self, config: &TaskConfig) -> Result<()> {
        config.validate()?;
        let rule = ScheduleRule::try_from(&config.schedule)?;
        let task = ScriptTask::from_config(config, self.shared.config.default_timeout());
        self.add_task(task, rule)?;
        if !config.enabled {
            self.set_enabled(&config.id, false)?;
        }
        Ok(())
    }

    /// Script task builder pre-filled with the configured default timeout.
    pub fn script_task(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        program: impl Into<String>,
    ) -> ScriptTask {
        ScriptTask::new(id, name, program).timeout(self.shared.config.default_timeout())
    }

    /// Unregister a task. An in-flight run is not interrupted; its result is
    /// dropped when it finishes.
    pub fn remove_task(&self, id: &str) -> Result<()> {
        let task = self.shared.registry.remove(id)?;
        tracing::info!("🗑️ Task removed: '{}' ({})", task.name(), id);
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.shared.registry.set_enabled(id, enabled, Utc::now())?;
        tracing::info!(
            "{} Task '{}' {}",
            if enabled { "▶️" } else { "⏸️" },
            id,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Start the dispatch loop. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut dispatcher = self.dispatcher();
        if dispatcher.is_some() {
            return Err(TidewatchError::AlreadyRunning);
        }
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(dispatch_loop(Arc::clone(&self.shared), rx));
        *dispatcher = Some(Dispatcher { shutdown, handle });

        tracing::info!(
            "⏰ Scheduler started (poll every {:.1}s, {} workers, {} retries)",
            self.shared.config.poll_interval().as_secs_f64(),
            self.shared.config.max_workers,
            self.shared.retry.max_retries
        );
        Ok(())
    }

    /// Stop dispatching, cancel pending retry waits and wait up to
    /// `grace_period` for running tasks, then call every task's `on_stop`.
    /// Returns whether every worker finished in time. Safe to call
    /// repeatedly; cleanup only runs when the scheduler was running.
    pub async fn stop(&self, grace_period: Duration) -> bool {
        let dispatcher = self.dispatcher().take();
        let was_running = dispatcher.is_some();
        if let Some(Dispatcher { shutdown, handle }) = dispatcher {
            tracing::info!("🛑 Scheduler stopping (grace {:.1}s)", grace_period.as_secs_f64());
            shutdown.send_replace(true);
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Dispatch loop ended abnormally: {e}");
            }
        }

        let drained = self.shared.pool.wait_idle(grace_period).await;
        if !drained {
            tracing::warn!(
                "⚠️ {} task(s) still running after grace period",
                self.shared.pool.active()
            );
        }
        if was_running {
            self.shared.run_stop_hooks().await;
            tracing::info!("🛑 Scheduler stopped");
        }
        drained
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher().is_some()
    }

    /// Dispatch one task now, outside its schedule.
    ///
    /// Returns `false` when the task is already running, disabled, exhausted,
    /// or no worker is free.
    pub fn run_now(&self, id: &str) -> Result<bool> {
        // held until the run is spawned so a concurrent stop() waits for it
        let dispatcher = self.dispatcher();
        let Some(d) = dispatcher.as_ref() else {
            return Err(TidewatchError::NotRunning);
        };
        let shutdown = d.shutdown.subscribe();
        let shared = &self.shared;
        match shared.registry.claim(id, Utc::now(), || shared.pool.reserve())? {
            Some((claim, slot)) => {
                tracing::info!("⚡ Task '{}' triggered manually", claim.task.name());
                shared.spawn_execution(claim, slot, shutdown);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Aggregate snapshot when `id` is `None`, else one task.
    pub fn get_task_status(&self, id: Option<&str>) -> Result<StatusSnapshot> {
        match id {
            Some(id) => self.task_status(id).map(StatusSnapshot::Task),
            None => Ok(StatusSnapshot::Scheduler(self.status())),
        }
    }

    pub fn task_status(&self, id: &str) -> Result<TaskStatusInfo> {
        self.shared.registry.snapshot(id)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus::new(
            self.is_running(),
            self.shared.pool.stats(),
            self.shared.registry.snapshot_all(),
        )
    }

    pub fn task_count(&self) -> usize {
        self.shared.registry.count()
    }
}

impl Shared {
    /// Claim and spawn everything due. Returns how many were dispatched.
    fn dispatch_due(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> usize {
        let claimed = self.registry.claim_due(Utc::now(), || self.pool.reserve());
        let count = claimed.len();
        for (claim, slot) in claimed {
            self.spawn_execution(claim, slot, shutdown.clone());
        }
        if count > 0 {
            tracing::debug!("📤 Dispatched {} task(s)", count);
        }
        count
    }

    fn spawn_execution(
        self: &Arc<Self>,
        claim: Claim,
        slot: WorkerSlot,
        shutdown: watch::Receiver<bool>,
    ) {
        tracing::debug!("🔔 Task triggered: '{}'", claim.task.name());
        let shared = Arc::clone(self);
        slot.spawn(async move { shared.execute(claim, shutdown).await });
    }

    /// Call `on_stop` on every registered task, in registration order. A
    /// failing or panicking hook is logged and the rest still run.
    async fn run_stop_hooks(&self) {
        for task in self.registry.tasks() {
            match AssertUnwindSafe(task.on_stop()).catch_unwind().await {
                Ok(Ok(())) => tracing::info!("🧹 Task '{}' cleaned up", task.name()),
                Ok(Err(e)) => tracing::warn!("⚠️ Cleanup of task '{}' failed: {e}", task.name()),
                Err(payload) => tracing::warn!(
                    "⚠️ Cleanup of task '{}' panicked: {}",
                    task.name(),
                    panic_message(&*payload)
                ),
            }
        }
    }

    /// Execution wrapper: retries, then one write-back.
    async fn execute(&self, claim: Claim, mut shutdown: watch::Receiver<bool>) {
        let started = Instant::now();
        let report = retry::run_with_retries(claim.task.as_ref(), &self.retry, &mut shutdown).await;
        let duration = started.elapsed();

        if report.result.is_ok() {
            tracing::info!(
                "✅ Task '{}' completed in {:.2}s ({} attempt(s))",
                claim.task.name(),
                duration.as_secs_f64(),
                report.attempts
            );
        }

        let done = Completion {
            outcome: report.outcome(),
            attempts: report.attempts,
            duration,
            error: report.error_message(),
        };
        if !self.registry.complete(&claim, done, Utc::now()) {
            tracing::debug!("Result of removed task '{}' discarded", claim.id);
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let poll = shared.config.poll_interval();
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + poll, poll);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            // a dropped sender means the scheduler itself is gone
            _ = shutdown.wait_for(|stopping| *stopping) => break,
        }
        shared.dispatch_due(&shutdown);
    }
    tracing::debug!("Dispatch loop exited");
}
