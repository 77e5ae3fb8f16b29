//! Jobs, Handles and the Runner Interface
//!
//! A [`Job`] is one command to execute for one stage. A [`JobRunner`]
//! takes ownership of it on `submit` and hands back a [`JobHandle`]
//! that can be waited on from one thread and cancelled from another.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::spec::RunnerSpec;
use crate::error::DispatchError;

/// Number of stderr lines kept for failure reports.
pub const STDERR_TAIL_LINES: usize = 20;

/// Process-wide sequence keeping log file names unique.
static LOG_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// An external program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl JobCommand {
    /// ```
    /// use stagerun::runners::JobCommand;
    ///
    /// let cmd = JobCommand::new("bcl2fastq")
    ///     .arg("--runfolder-dir")
    ///     .arg("/data/171020_M00879_00002_AHGXXXX")
    ///     .args(["-r", "1", "-p", "8"]);
    /// assert_eq!(cmd.args.len(), 6);
    /// ```
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
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
}

impl fmt::Display for JobCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A unit of work for a runner.
#[derive(Debug, Clone)]
pub struct Job {
    /// Stage the job belongs to
    pub stage: String,
    /// Program to run
    pub command: JobCommand,
    /// Directory the program runs in
    pub working_dir: PathBuf,
    /// Backend and its submission arguments
    pub runner: RunnerSpec,
    /// Variables added to the inherited environment
    pub env: BTreeMap<String, String>,
}

/// Log files allocated for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    stem: PathBuf,
}

impl JobLogs {
    /// Reserves uniquely named log paths for a stage under `log_dir`.
    pub fn allocate(log_dir: &Path, stage: &str) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let seq = LOG_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let stem = log_dir.join(format!(
            "{}.{}.{}",
            sanitize_name(stage),
            std::process::id(),
            seq
        ));

        Ok(Self {
            stdout: with_suffix(&stem, "out"),
            stderr: with_suffix(&stem, "err"),
            stem,
        })
    }

    /// A sibling path with a different suffix, e.g. `sh` or `status`.
    pub fn sibling(&self, suffix: &str) -> PathBuf {
        with_suffix(&self.stem, suffix)
    }
}

fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Replaces anything but `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

/// Last `lines` lines of a log file; empty if it cannot be read.
pub fn log_tail(path: &Path, lines: usize) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Cancellation signal that can also wake a sleeping waiter.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelFlag {
    pub fn cancel(&self) {
        let mut cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        *cancelled = true;
        self.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleeps up to `timeout`, returning early (with `true`) on cancel.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        let (cancelled, _) = self
            .wake
            .wait_timeout_while(cancelled, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *cancelled
    }
}

/// How a job that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
}

struct HandleInner {
    stage: String,
    id: String,
    logs: JobLogs,
    cancel: CancelFlag,
    state: Box<dyn Any + Send + Sync>,
}

/// Shared reference to a submitted job.
///
/// Cloning is cheap; all clones refer to the same job, so one thread can
/// `wait` while another calls `cancel`.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

impl JobHandle {
    /// Creates a handle carrying backend-specific `state`.
    pub fn new(
        stage: impl Into<String>,
        id: impl Into<String>,
        logs: JobLogs,
        state: impl Any + Send + Sync,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                stage: stage.into(),
                id: id.into(),
                logs,
                cancel: CancelFlag::default(),
                state: Box::new(state),
            }),
        }
    }

    pub fn stage(&self) -> &str {
        &self.inner.stage
    }

    /// Backend job identifier: a process ID or a scheduler job ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn logs(&self) -> &JobLogs {
        &self.inner.logs
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.inner.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Backend state, if it is of type `T`.
    pub fn state<T: Any>(&self) -> Option<&T> {
        self.inner.state.downcast_ref::<T>()
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("stage", &self.inner.stage)
            .field("id", &self.inner.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// An execution backend.
pub trait JobRunner: Send + Sync {
    /// Starts a job. Fails with [`DispatchError::Submission`] if the job
    /// could not be started.
    fn submit(&self, job: Job) -> Result<JobHandle, DispatchError>;

    /// Blocks until the job reaches a terminal state.
    fn wait(&self, handle: &JobHandle) -> Result<JobOutcome, DispatchError>;

    /// Requests termination. Safe to call from any thread, never blocks
    /// indefinitely, and leaves the handle terminated.
    fn cancel(&self, handle: &JobHandle);
}

/// Error for a handle passed to a runner that did not create it.
pub(crate) fn foreign_handle(handle: &JobHandle) -> DispatchError {
    DispatchError::submission(
        handle.stage(),
        format!("job {} was not submitted by this runner", handle.id()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;
    use tempfile::tempdir;

    #[test]
    fn test_job_command_display() {
        let cmd = JobCommand::new("cutadapt").args(["-a", "AGATCGGAAGAGC", "in.fastq"]);
        assert_eq!(cmd.to_string(), "cutadapt -a AGATCGGAAGAGC in.fastq");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("make_fastqs"), "make_fastqs");
        assert_eq!(sanitize_name("run qc/PJB"), "run_qc_PJB");
        assert_eq!(sanitize_name(""), "job");
    }

    #[test]
    fn test_log_allocation_is_unique() {
        let temp_dir = tempdir().unwrap();
        let first = JobLogs::allocate(temp_dir.path(), "qc").unwrap();
        let second = JobLogs::allocate(temp_dir.path(), "qc").unwrap();

        assert_ne!(first.stdout, second.stdout);
        assert_ne!(first.stderr, second.stderr);
        assert!(first.stdout.starts_with(temp_dir.path()));
        assert!(first.stdout.to_string_lossy().ends_with(".out"));
        assert!(first.sibling("status").to_string_lossy().ends_with(".status"));
    }

    #[test]
    fn test_log_allocation_creates_directory() {
        let temp_dir = tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs/002_make_fastqs");
        JobLogs::allocate(&log_dir, "make_fastqs").unwrap();
        assert!(log_dir.is_dir());
    }

    #[test]
    fn test_log_tail() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("job.err");
        let lines: Vec<String> = (1..=30).map(|i| format!("line {}", i)).collect();
        fs::write(&path, lines.join("\n")).unwrap();

        let tail = log_tail(&path, 3);
        assert_eq!(tail, "line 28\nline 29\nline 30");
        assert_eq!(log_tail(&temp_dir.path().join("missing.err"), 3), "");
    }

    #[test]
    fn test_cancel_flag_times_out() {
        let flag = CancelFlag::default();
        let start = Instant::now();
        assert!(!flag.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!flag.is_cancelled());
    }

    #[test]
    fn test_cancel_flag_wakes_waiter() {
        let flag = Arc::new(CancelFlag::default());
        let canceller = Arc::clone(&flag);

        let start = Instant::now();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        assert!(flag.wait_timeout(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(10));
        worker.join().unwrap();
    }

    #[test]
    fn test_handle_state_downcast() {
        let temp_dir = tempdir().unwrap();
        let logs = JobLogs::allocate(temp_dir.path(), "qc").unwrap();
        let handle = JobHandle::new("qc", "4242", logs, 7u32);

        assert_eq!(handle.state::<u32>(), Some(&7));
        assert!(handle.state::<String>().is_none());
        assert_eq!(handle.id(), "4242");

        let clone = handle.clone();
        clone.cancel_flag().cancel();
        assert!(handle.is_cancelled());
    }
}
