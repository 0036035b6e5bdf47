//! Built-in task variants: external scripts and bound callables.
//!
//! Anything else implements [`Task`] directly.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tidewatch_core::{Task, TaskConfig, TaskFailure, TaskInfo};

/// Timeout for script tasks built without an explicit one.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Bytes of stderr kept in a failure message.
const STDERR_LIMIT: usize = 2000;

/// Runs an external program. A run that outlives `timeout` is killed and
/// reported as [`TaskFailure::Timeout`].
#[derive(Debug, Clone)]
pub struct ScriptTask {
    info: TaskInfo,
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl ScriptTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            info: TaskInfo::new(id, name),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    /// Build from a `[[tasks]]` config entry.
    pub fn from_config(config: &TaskConfig, default_timeout: Duration) -> Self {
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        let mut task = Self::new(&config.id, config.display_name(), &config.command)
            .with_description(&config.description)
            .args(config.args.iter().cloned())
            .timeout(timeout);
        task.env = config.env.clone();
        task.working_dir = config.expanded_working_dir();
        task
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.info.description = description.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }

    /// Program and arguments joined for display.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Task for ScriptTask {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    async fn execute(&self) -> Result<bool, TaskFailure> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!("🐚 Running script task '{}': {}", self.info.name, self.command_line());
        let start = Instant::now();

        // Dropping the `output()` future on timeout drops the child, which
        // kills it because of `kill_on_drop`.
        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(TaskFailure::Spawn {
                    program: self.program.clone(),
                    source,
                });
            }
            Err(_) => {
                tracing::warn!(
                    "⏰ Script task '{}' timed out after {:.1}s, process killed",
                    self.info.name,
                    self.timeout.as_secs_f64()
                );
                return Err(TaskFailure::Timeout(self.timeout));
            }
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            tracing::debug!(
                "Script task '{}' finished in {:.1}s ({} bytes of output)",
                self.info.name,
                start.elapsed().as_secs_f64(),
                stdout.len()
            );
            Ok(true)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TaskFailure::NonZeroExit {
                code: output.status.code(),
                stderr: truncate_tail(stderr.trim(), STDERR_LIMIT),
            })
        }
    }
}

/// Keep the last `limit` bytes of `s`, on a char boundary.
fn truncate_tail(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut start = s.len() - limit;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}

/// Positional and keyword arguments bound to a [`FunctionTask`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskArgs {
    pub positional: Vec<Value>,
    pub keyword: BTreeMap<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn kw(&self, key: &str) -> Option<&Value> {
        self.keyword.get(key)
    }
}

type TaskFn = dyn Fn(&TaskArgs) -> Result<bool, TaskFailure> + Send + Sync;

/// Invokes a bound callable on the blocking thread pool.
///
/// There is no timeout and no way to interrupt the callable once it has
/// started; a hung callable keeps its worker slot until it returns.
#[derive(Clone)]
pub struct FunctionTask {
    info: TaskInfo,
    func: Arc<TaskFn>,
    args: Arc<TaskArgs>,
}

impl FunctionTask {
    pub fn new<F>(id: impl Into<String>, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&TaskArgs) -> Result<bool, TaskFailure> + Send + Sync + 'static,
    {
        Self {
            info: TaskInfo::new(id, name),
            func: Arc::new(func),
            args: Arc::new(TaskArgs::default()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.info.description = description.into();
        self
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = Arc::new(args);
        self
    }

    pub fn bound_args(&self) -> &TaskArgs {
        &self.args
    }
}

impl fmt::Debug for FunctionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTask")
            .field("info", &self.info)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Task for FunctionTask {
    fn info(&self) -> &TaskInfo {
        &self.info
    }

    async fn execute(&self) -> Result<bool, TaskFailure> {
        let func = Arc::clone(&self.func);
        let args = Arc::clone(&self.args);
        match tokio::task::spawn_blocking(move || func(&args)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskFailure::Panicked(panic_message(&*e.into_panic()))),
            Err(e) => Err(TaskFailure::msg(format!("function task was cancelled: {e}"))),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
