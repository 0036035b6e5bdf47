//! Timed end-to-end scenarios against a running scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tidewatch_scheduler::{
    FunctionTask, RunOutcome, ScheduleRule, SchedulerConfig, Task, TaskFailure, TaskInfo,
    TaskScheduler, TaskState, TaskStatusInfo,
};

fn config(max_workers: usize, max_retries: u32, retry_delay_secs: f64) -> SchedulerConfig {
    SchedulerConfig {
        max_workers,
        poll_interval_secs: 0.05,
        default_timeout_secs: 30,
        max_retries,
        retry_delay_secs,
    }
}

/// Poll a task's status until `check` holds or `timeout` passes.
async fn wait_for_task(
    sched: &TaskScheduler,
    id: &str,
    timeout: Duration,
    check: impl Fn(&TaskStatusInfo) -> bool,
) -> TaskStatusInfo {
    let deadline = Instant::now() + timeout;
    loop {
        let status = sched.task_status(id).unwrap();
        if check(&status) || Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Async task that sleeps, counting invocations and concurrency.
struct Sleeper {
    info: TaskInfo,
    work: Duration,
    calls: Arc<AtomicU32>,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Sleeper {
    fn new(id: &str, work: Duration) -> Self {
        Self {
            info: TaskInfo::new(id, id),
            work,
            calls: Arc::new(AtomicU32::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn sharing(id: &str, work: Duration, in_flight: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> Self {
        Self {
            in_flight: Arc::clone(in_flight),
            peak: Arc::clone(peak),
            ..Self::new(id, work)
        }
    }
}

#[async_trait]
impl Task for Sleeper {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    async fn execute(&self) -> Result<bool, TaskFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.work).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Always fails, counting attempts.
struct AlwaysFails {
    info: TaskInfo,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Task for AlwaysFails {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    async fn execute(&self) -> Result<bool, TaskFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(TaskFailure::msg(format!("upload rejected (attempt {n})")))
    }
}

struct Panics(TaskInfo);

#[async_trait]
impl Task for Panics {
    fn info(&self) -> &TaskInfo {
        &self.0
    }

    async fn execute(&self) -> Result<bool, TaskFailure> {
        panic!("frame decoder crashed")
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interval_and_once_scenario() {
    let sched = TaskScheduler::new(config(4, 0, 0.0)).unwrap();
    let a = Sleeper::new("a", Duration::from_millis(10));
    let b = Sleeper::new("b", Duration::from_millis(10));
    let (a_calls, b_calls) = (Arc::clone(&a.calls), Arc::clone(&b.calls));
    sched.add_task(a, ScheduleRule::every_secs(1).unwrap()).unwrap();
    sched.add_task(b, ScheduleRule::once_after(Duration::from_secs(2))).unwrap();

    sched.start().unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(sched.stop(Duration::from_secs(2)).await);

    let a = sched.task_status("a").unwrap();
    let b = sched.task_status("b").unwrap();
    assert!(a.run_count >= 2, "a ran {} times", a.run_count);
    assert_eq!(b.run_count, 1);
    assert_eq!(b.state, TaskState::Terminal);
    assert_eq!(b.next_run_time, None);
    assert_eq!(u64::from(a_calls.load(Ordering::SeqCst)), a.run_count);
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retry_scenario_three_attempts_then_failed() {
    let sched = TaskScheduler::new(config(2, 2, 0.1)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let task = AlwaysFails {
        info: TaskInfo::new("upload", "Upload"),
        calls: Arc::clone(&calls),
    };
    sched.add_task(task, ScheduleRule::interval(Duration::from_millis(500)).unwrap()).unwrap();
    sched.start().unwrap();

    let status = wait_for_task(&sched, "upload", Duration::from_secs(3), |s| s.run_count >= 1).await;
    assert_eq!(status.run_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(status.last_attempts, 3);
    assert_eq!(status.total_attempts, 3);
    assert_eq!(status.failure_count, 1);
    assert_eq!(status.state, TaskState::Failed);
    assert_eq!(status.last_outcome, Some(RunOutcome::Failed));
    assert_eq!(status.last_error.as_deref(), Some("upload rejected (attempt 3)"));

    // still scheduled per its rule
    let last = status.last_run_time.unwrap();
    assert_eq!(status.next_run_time, Some(last + chrono::TimeDelta::milliseconds(500)));

    let status = wait_for_task(&sched, "upload", Duration::from_secs(3), |s| s.run_count >= 2).await;
    assert_eq!(status.run_count, 2);
    assert_eq!(status.total_attempts, 6);
    sched.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_waits_for_running_task() {
    let sched = TaskScheduler::new(config(2, 0, 0.0)).unwrap();
    sched
        .add_task(Sleeper::new("slow", Duration::from_secs(2)), ScheduleRule::once_after(Duration::ZERO))
        .unwrap();
    sched.start().unwrap();

    let status = wait_for_task(&sched, "slow", Duration::from_secs(2), |s| s.state == TaskState::Running).await;
    assert_eq!(status.state, TaskState::Running);

    let start = Instant::now();
    assert!(sched.stop(Duration::from_secs(5)).await);
    assert!(start.elapsed() <= Duration::from_secs(5));

    let all = sched.status();
    assert!(!all.scheduler_status);
    assert_eq!(all.running_tasks, 0);
    assert_eq!(all.pool.active, 0);
    assert_eq!(sched.task_status("slow").unwrap().run_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_interrupts_retry_wait() {
    let sched = TaskScheduler::new(config(1, 5, 30.0)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    sched
        .add_task(
            AlwaysFails {
                info: TaskInfo::new("doomed", "Doomed"),
                calls: Arc::clone(&calls),
            },
            ScheduleRule::once_after(Duration::ZERO),
        )
        .unwrap();
    sched.start().unwrap();
    wait_for_task(&sched, "doomed", Duration::from_secs(2), |_| calls.load(Ordering::SeqCst) >= 1).await;

    let start = Instant::now();
    assert!(sched.stop(Duration::from_secs(5)).await);
    assert!(start.elapsed() < Duration::from_secs(5));

    let status = sched.task_status("doomed").unwrap();
    assert_eq!(status.run_count, 1);
    assert_eq!(status.failure_count, 1);
    assert_eq!(status.last_attempts, 1);
    assert_eq!(status.state, TaskState::Terminal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_never_exceeds_max_workers() {
    let sched = TaskScheduler::new(config(2, 0, 0.0)).unwrap();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for i in 0..6 {
        let id = format!("job{i}");
        let task = Sleeper::sharing(&id, Duration::from_millis(150), &in_flight, &peak);
        sched.add_task(task, ScheduleRule::interval(Duration::from_millis(100)).unwrap()).unwrap();
    }
    sched.start().unwrap();

    let deadline = Instant::now() + Duration::from_millis(1200);
    while Instant::now() < deadline {
        assert!(sched.status().running_tasks <= 2);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    assert!(sched.stop(Duration::from_secs(2)).await);

    let status = sched.status();
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(status.pool.peak_active <= 2);
    assert!(status.pool.total_processed > 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_once_runs_exactly_once() {
    let sched = TaskScheduler::new(config(2, 0, 0.0)).unwrap();
    let task = Sleeper::new("calibrate", Duration::from_millis(5));
    let calls = Arc::clone(&task.calls);
    sched.add_task(task, ScheduleRule::once_after(Duration::from_millis(100))).unwrap();
    sched.start().unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(sched.stop(Duration::from_secs(1)).await);

    let status = sched.task_status("calibrate").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(status.run_count, 1);
    assert_eq!(status.success_count, 1);
    assert_eq!(status.state, TaskState::Terminal);
    assert_eq!(sched.run_now("calibrate").unwrap_err().to_string(), "Scheduler is not running");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panic_error_and_false_recorded_alike() {
    let sched = TaskScheduler::new(config(4, 0, 0.0)).unwrap();
    let now = ScheduleRule::once_after(Duration::ZERO);
    sched.add_task(Panics(TaskInfo::new("panics", "Panics")), now.clone()).unwrap();
    sched
        .add_task(FunctionTask::new("errors", "Errors", |_| Err("serial timeout".into())), now.clone())
        .unwrap();
    sched
        .add_task(FunctionTask::new("false", "False", |_| Ok(false)), now)
        .unwrap();
    sched.start().unwrap();

    for id in ["panics", "errors", "false"] {
        let s = wait_for_task(&sched, id, Duration::from_secs(2), |s| s.run_count >= 1).await;
        assert_eq!(s.run_count, 1, "{id}");
        assert_eq!(s.failure_count, 1, "{id}");
        assert_eq!(s.success_count, 0, "{id}");
        assert_eq!(s.success_rate, 0.0, "{id}");
        assert_eq!(s.last_outcome, Some(RunOutcome::Failed), "{id}");
        assert!(s.last_error.as_deref().is_some_and(|e| !e.is_empty()), "{id}");
    }
    assert!(sched.stop(Duration::from_secs(1)).await);
    assert!(sched.task_status("panics").unwrap().last_error.unwrap().contains("frame decoder crashed"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_error_cleared_on_success() {
    let sched = TaskScheduler::new(config(2, 0, 0.0)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let task = FunctionTask::new("flaky", "Flaky", move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err("first run fails".into())
        } else {
            Ok(true)
        }
    });
    sched.add_task(task, ScheduleRule::interval(Duration::from_millis(150)).unwrap()).unwrap();
    sched.start().unwrap();

    let s = wait_for_task(&sched, "flaky", Duration::from_secs(2), |s| s.run_count >= 1).await;
    assert_eq!(s.last_error.as_deref(), Some("first run fails"));

    let s = wait_for_task(&sched, "flaky", Duration::from_secs(2), |s| s.run_count >= 2).await;
    assert_eq!(s.last_error, None);
    assert_eq!(s.state, TaskState::Idle);
    assert_eq!(s.failure_count, 1);
    sched.stop(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interval_next_run_after_last_run() {
    let sched = TaskScheduler::new(config(2, 0, 0.0)).unwrap();
    sched
        .add_task(Sleeper::new("tick", Duration::ZERO), ScheduleRule::interval(Duration::from_millis(100)).unwrap())
        .unwrap();
    sched.start().unwrap();

    let mut seen = 0;
    let deadline = Instant::now() + Duration::from_secs(3);
    while seen < 4 && Instant::now() < deadline {
        let s = sched.task_status("tick").unwrap();
        if s.run_count > seen && s.state != TaskState::Running {
            assert!(s.next_run_time.unwrap() > s.last_run_time.unwrap());
            seen = s.run_count;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sched.stop(Duration::from_secs(1)).await;
    assert!(seen >= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_removed_task_result_is_discarded() {
    let sched = TaskScheduler::new(config(2, 0, 0.0)).unwrap();
    sched
        .add_task(Sleeper::new("job", Duration::from_millis(300)), ScheduleRule::once_after(Duration::ZERO))
        .unwrap();
    sched.start().unwrap();
    wait_for_task(&sched, "job", Duration::from_secs(2), |s| s.state == TaskState::Running).await;

    sched.remove_task("job").unwrap();
    sched
        .add_task(Sleeper::new("job", Duration::ZERO), ScheduleRule::every_secs(3600).unwrap())
        .unwrap();
    assert!(sched.stop(Duration::from_secs(2)).await);

    let s = sched.task_status("job").unwrap();
    assert_eq!(s.run_count, 0);
    assert_eq!(s.state, TaskState::Idle);
    assert_eq!(sched.task_count(), 1);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_script_timeout_recorded() {
    let sched = TaskScheduler::new(config(2, 0, 0.0)).unwrap();
    let task = sched
        .script_task("hang", "Hang", "sleep")
        .arg("10")
        .timeout(Duration::from_millis(200));
    sched.add_task(task, ScheduleRule::once_after(Duration::ZERO)).unwrap();
    sched.start().unwrap();

    let s = wait_for_task(&sched, "hang", Duration::from_secs(3), |s| s.run_count >= 1).await;
    assert_eq!(s.last_outcome, Some(RunOutcome::TimedOut));
    assert!(s.last_error.unwrap().contains("timed out"));
    assert!(sched.stop(Duration::from_secs(1)).await);
}
