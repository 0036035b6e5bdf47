//! In-dispatch retry loop.
//!
//! One dispatch walks `Attempt → Success | Retry → Attempt | Failed`.
//! The wait between attempts is cut short by a shutdown signal, which turns
//! the pending retry into a final failure.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tidewatch_core::{SchedulerConfig, Task, TaskFailure};
use tokio::sync::watch;

use crate::registry::RunOutcome;
use crate::tasks::panic_message;

/// How many extra attempts a failed dispatch gets, and how far apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

enum AttemptState {
    Attempt(u32),
    Retry { attempt: u32, failure: TaskFailure },
    Succeeded(u32),
    Failed { attempts: u32, failure: TaskFailure },
}

/// What one dispatch amounted to after retries.
#[derive(Debug)]
pub struct ExecutionReport {
    pub attempts: u32,
    pub result: Result<(), TaskFailure>,
    /// Retries were abandoned because the scheduler is stopping.
    pub interrupted: bool,
}

impl ExecutionReport {
    pub fn outcome(&self) -> RunOutcome {
        match &self.result {
            Ok(()) => RunOutcome::Succeeded,
            Err(f) if f.is_timeout() => RunOutcome::TimedOut,
            Err(_) => RunOutcome::Failed,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.result.as_ref().err().map(ToString::to_string)
    }
}

/// Run one attempt, folding `Ok(false)` and panics into `TaskFailure`.
pub async fn attempt(task: &dyn Task) -> Result<(), TaskFailure> {
    match AssertUnwindSafe(task.execute()).catch_unwind().await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(TaskFailure::Reported),
        Ok(Err(failure)) => Err(failure),
        Err(payload) => Err(TaskFailure::Panicked(panic_message(&*payload))),
    }
}

/// Run `task` under `policy`. Never fails; the outcome is in the report.
pub async fn run_with_retries(
    task: &dyn Task,
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> ExecutionReport {
    let mut state = AttemptState::Attempt(1);
    let mut interrupted = false;
    loop {
        state = match state {
            AttemptState::Attempt(n) => match attempt(task).await {
                Ok(()) => AttemptState::Succeeded(n),
                Err(failure) if n < policy.max_attempts() => AttemptState::Retry { attempt: n, failure },
                Err(failure) => AttemptState::Failed { attempts: n, failure },
            },
            AttemptState::Retry { attempt, failure } => {
                tracing::warn!(
                    "🔁 Task '{}' attempt {}/{} failed: {}, retrying in {:.1}s",
                    task.name(),
                    attempt,
                    policy.max_attempts(),
                    failure,
                    policy.retry_delay.as_secs_f64()
                );
                if wait_for_retry(policy.retry_delay, shutdown).await {
                    AttemptState::Attempt(attempt + 1)
                } else {
                    tracing::info!("🛑 Task '{}' retries cancelled by shutdown", task.name());
                    interrupted = true;
                    AttemptState::Failed { attempts: attempt, failure }
                }
            }
            AttemptState::Succeeded(attempts) => {
                return ExecutionReport {
                    attempts,
                    result: Ok(()),
                    interrupted,
                };
            }
            AttemptState::Failed { attempts, failure } => {
                if !interrupted {
                    tracing::error!(
                        "❌ Task '{}' failed after {} attempt(s): {}",
                        task.name(),
                        attempts,
                        failure
                    );
                }
                return ExecutionReport {
                    attempts,
                    result: Err(failure),
                    interrupted,
                };
            }
        };
    }
}

/// Sleep for `delay` unless shutdown arrives first. Returns whether to retry.
async fn wait_for_retry(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        // a dropped sender counts as shutdown too
        _ = shutdown.wait_for(|stopping| *stopping) => false,
    }
}
