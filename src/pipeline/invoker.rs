//! External task invoker: runs a program with a timeout and captures output.
//!
//! Every failure (spawn error, timeout, non-zero exit) is folded into
//! `TaskOutcome::NoResult`. Nothing crosses this boundary as an error.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Poll interval while waiting on a child.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl TaskSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
            working_dir: None,
            env: Vec::new(),
        }
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
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program plus arguments, for log lines.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured output of a task that ran to a successful exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

/// Why a task produced no result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoResultReason {
    SpawnFailed { message: String },
    TimedOut { after_ms: u64 },
    NonZeroExit { code: Option<i32>, stderr: String },
}

impl std::fmt::Display for NoResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpawnFailed { message } => write!(f, "failed to start: {message}"),
            Self::TimedOut { after_ms } => write!(f, "timed out after {after_ms}ms"),
            Self::NonZeroExit { code: Some(code), .. } => write!(f, "exited with status {code}"),
            Self::NonZeroExit { code: None, .. } => write!(f, "terminated by signal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(TaskOutput),
    NoResult(NoResultReason),
}

impl TaskOutcome {
    pub fn output(&self) -> Option<&TaskOutput> {
        match self {
            Self::Completed(out) => Some(out),
            Self::NoResult(_) => None,
        }
    }

    pub fn into_output(self) -> Option<TaskOutput> {
        match self {
            Self::Completed(out) => Some(out),
            Self::NoResult(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Runs external tasks. Implementations must never panic or return errors;
/// every failure becomes `TaskOutcome::NoResult`.
pub trait TaskInvoker {
    fn invoke(&self, task: &TaskSpec) -> TaskOutcome;

    /// Whether `program` can be started at all.
    fn is_available(&self, program: &str) -> bool {
        program_available(program)
    }
}

/// Invoker backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessInvoker;

impl TaskInvoker for ProcessInvoker {
    fn invoke(&self, task: &TaskSpec) -> TaskOutcome {
        let started = Instant::now();

        let mut command = Command::new(&task.program);
        command
            .args(&task.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &task.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &task.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(task = %task.display(), error = %e, "Task failed to start");
                return TaskOutcome::NoResult(NoResultReason::SpawnFailed {
                    message: e.to_string(),
                });
            }
        };

        // Drain both pipes on their own threads so a child that fills a pipe
        // buffer cannot stall the wait loop.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let (status, timed_out) = wait_with_deadline(&mut child, task.timeout);
        let duration_ms = started.elapsed().as_millis() as u64;

        // Grandchildren may still hold the pipes open after a kill; the
        // drain threads are left to finish on their own.
        if timed_out {
            tracing::warn!(
                task = %task.display(),
                timeout_ms = task.timeout.as_millis() as u64,
                "Task timed out and was killed"
            );
            return TaskOutcome::NoResult(NoResultReason::TimedOut {
                after_ms: duration_ms,
            });
        }

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        let status = match status {
            Some(status) => status,
            None => {
                return TaskOutcome::NoResult(NoResultReason::SpawnFailed {
                    message: "lost track of child process".into(),
                })
            }
        };

        if !status.success() {
            tracing::warn!(
                task = %task.display(),
                code = ?status.code(),
                "Task exited unsuccessfully"
            );
            return TaskOutcome::NoResult(NoResultReason::NonZeroExit {
                code: status.code(),
                stderr,
            });
        }

        tracing::debug!(
            task = %task.display(),
            duration_ms,
            stdout_len = stdout.len(),
            "Task completed"
        );

        TaskOutcome::Completed(TaskOutput {
            stdout,
            stderr,
            exit_code: status.code(),
            duration_ms,
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Wait for the child until `limit` elapses. Returns the exit status (if it
/// could be reaped) and whether the deadline was hit.
fn wait_with_deadline(child: &mut Child, limit: Duration) -> (Option<std::process::ExitStatus>, bool) {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return (Some(status), false),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll child process");
                let _ = child.kill();
                return (child.wait().ok(), false);
            }
        }
        if started.elapsed() >= limit {
            let _ = child.kill();
            return (child.wait().ok(), true);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Whether `program` resolves to a file, either directly (when it contains a
/// path separator) or through `PATH`.
pub fn program_available(program: &str) -> bool {
    if program.is_empty() {
        return false;
    }
    let as_path = Path::new(program);
    if as_path.components().count() > 1 {
        return as_path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}
