//! Local Job Runner
//!
//! Runs jobs as child processes of the dispatching process. Output goes
//! to per-job log files rather than pipes, so a waiting thread only has
//! to watch for exit and stays responsive to cancellation.
//!
//! The argument string understands `nslots=N`, exported to the job as
//! `NSLOTS` (1 if absent), mirroring what Grid Engine gives cluster jobs.

use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, warn};

use super::job::{
    foreign_handle, log_tail, Job, JobHandle, JobLogs, JobOutcome, JobRunner, STDERR_TAIL_LINES,
};
use crate::error::DispatchError;

/// Interval between exit checks while waiting on a child.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Backend state of a local job.
struct LocalProcess {
    child: Mutex<Option<Child>>,
}

impl LocalProcess {
    fn lock(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs jobs as local subprocesses.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    log_dir: PathBuf,
    poll_interval: Duration,
}

impl LocalRunner {
    /// Creates a runner writing job logs under `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            poll_interval: EXIT_POLL_INTERVAL,
        }
    }

    fn classify(handle: &JobHandle, status: ExitStatus) -> Result<JobOutcome, DispatchError> {
        if handle.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }
        if status.success() {
            debug!("Stage '{}' (pid {}) completed", handle.stage(), handle.id());
            return Ok(JobOutcome::Completed);
        }

        debug!(
            "Stage '{}' (pid {}) failed with exit code: {:?}",
            handle.stage(),
            handle.id(),
            status.code()
        );
        Err(DispatchError::Execution {
            stage: handle.stage().to_string(),
            exit_code: status.code(),
            stderr_tail: log_tail(&handle.logs().stderr, STDERR_TAIL_LINES),
        })
    }

    /// Kills (if still running) and reaps the child.
    fn reap(handle: &JobHandle, process: &LocalProcess) {
        if let Some(mut child) = process.lock().take() {
            if let Err(e) = child.kill() {
                debug!("Kill of pid {} not needed: {}", handle.id(), e);
            }
            if let Err(e) = child.wait() {
                warn!("Failed to reap pid {}: {}", handle.id(), e);
            }
        }
    }
}

/// Reads `nslots=N` from a runner argument string.
fn nslots(args: &str) -> Result<u32, String> {
    match args
        .split_whitespace()
        .find_map(|token| token.strip_prefix("nslots="))
    {
        Some(value) => match value.parse::<u32>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(format!("invalid nslots value '{}'", value)),
        },
        None => Ok(1),
    }
}

impl JobRunner for LocalRunner {
    fn submit(&self, job: Job) -> Result<JobHandle, DispatchError> {
        let stage = job.stage.as_str();
        let slots = nslots(job.runner.args()).map_err(|e| DispatchError::submission(stage, e))?;

        let logs = JobLogs::allocate(&self.log_dir, stage).map_err(|e| {
            DispatchError::submission(
                stage,
                format!("cannot create logs in {}: {}", self.log_dir.display(), e),
            )
        })?;
        let stdout = File::create(&logs.stdout)
            .map_err(|e| DispatchError::submission(stage, format!("cannot open stdout log: {}", e)))?;
        let stderr = File::create(&logs.stderr)
            .map_err(|e| DispatchError::submission(stage, format!("cannot open stderr log: {}", e)))?;

        let mut cmd = Command::new(&job.command.program);
        cmd.args(&job.command.args)
            .current_dir(&job.working_dir)
            .envs(&job.env)
            .env("NSLOTS", slots.to_string())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let child = cmd.spawn().map_err(|e| {
            DispatchError::submission(
                stage,
                format!("failed to start '{}': {}", job.command.program, e),
            )
        })?;

        let pid = child.id();
        debug!(
            "Stage '{}' started locally (pid {}): {}",
            stage, pid, job.command
        );

        Ok(JobHandle::new(
            job.stage,
            pid.to_string(),
            logs,
            LocalProcess {
                child: Mutex::new(Some(child)),
            },
        ))
    }

    fn wait(&self, handle: &JobHandle) -> Result<JobOutcome, DispatchError> {
        let process = handle
            .state::<LocalProcess>()
            .ok_or_else(|| foreign_handle(handle))?;

        loop {
            let finished = {
                let mut guard = process.lock();
                match guard.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(Some(status)) => {
                            guard.take();
                            Some(status)
                        }
                        Ok(None) => None,
                        Err(e) => {
                            return Err(DispatchError::Execution {
                                stage: handle.stage().to_string(),
                                exit_code: None,
                                stderr_tail: format!("lost track of pid {}: {}", handle.id(), e),
                            })
                        }
                    },
                    None if handle.is_cancelled() => return Ok(JobOutcome::Cancelled),
                    None => {
                        return Err(DispatchError::submission(
                            handle.stage(),
                            format!("pid {} was already collected", handle.id()),
                        ))
                    }
                }
            };

            if let Some(status) = finished {
                return Self::classify(handle, status);
            }

            if handle.cancel_flag().wait_timeout(self.poll_interval) {
                Self::reap(handle, process);
                return Ok(JobOutcome::Cancelled);
            }
        }
    }

    fn cancel(&self, handle: &JobHandle) {
        handle.cancel_flag().cancel();

        let Some(process) = handle.state::<LocalProcess>() else {
            warn!("Cannot cancel job {}: not a local job", handle.id());
            return;
        };

        debug!("Terminating stage '{}' (pid {})", handle.stage(), handle.id());
        Self::reap(handle, process);
    }
}
