//! Grid Engine Scheduler
//!
//! Drives `qsub`, `qstat` and `qdel`. Jobs are submitted with `-terse`
//! so `qsub` prints only the job ID; a job is considered finished once
//! `qstat -j` reports that it does not exist. Every command runs under a
//! timeout and is killed when it hangs.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use log::debug;
use wait_timeout::ChildExt;

use super::cluster::{ClusterState, Scheduler, SchedulerError, SubmitRequest};
use crate::config::defaults::DEFAULT_SCHEDULER_TIMEOUT;

/// `qstat -j` message for jobs that have left the queue.
const UNKNOWN_JOB_MARKER: &str = "do not exist";

/// Grid Engine command line front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridEngine {
    qsub: PathBuf,
    qstat: PathBuf,
    qdel: PathBuf,
    timeout: Duration,
}

impl Default for GridEngine {
    fn default() -> Self {
        Self {
            qsub: PathBuf::from("qsub"),
            qstat: PathBuf::from("qstat"),
            qdel: PathBuf::from("qdel"),
            timeout: DEFAULT_SCHEDULER_TIMEOUT,
        }
    }
}

impl GridEngine {
    /// Uses the Grid Engine commands found in `dir`.
    pub fn with_bin_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            qsub: dir.join("qsub"),
            qstat: dir.join("qstat"),
            qdel: dir.join("qdel"),
            ..Self::default()
        }
    }

    /// Limits how long a single scheduler command may run.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs a scheduler command, killing it after the timeout. A timeout
    /// is reported through `on_timeout` so each command keeps its own
    /// error kind.
    fn run(
        &self,
        program: &Path,
        cmd: &mut Command,
        on_timeout: fn(String) -> SchedulerError,
    ) -> Result<Output, SchedulerError> {
        let io_error = |source: io::Error| SchedulerError::Io {
            command: program.display().to_string(),
            source,
        };

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(io_error)?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        match child.wait_timeout(self.timeout).map_err(io_error)? {
            Some(status) => Ok(Output {
                status,
                stdout: collect(stdout),
                stderr: collect(stderr),
            }),
            None => {
                debug!(
                    "{} still running after {:?}, killing it",
                    program.display(),
                    self.timeout
                );
                if let Err(e) = child.kill() {
                    debug!("Kill of {} failed: {}", program.display(), e);
                }
                let _ = child.wait();
                // Grandchildren may still hold the pipes; readers are left detached.
                Err(on_timeout(format!(
                    "{} did not finish within {:?}",
                    program.display(),
                    self.timeout
                )))
            }
        }
    }
}

/// Reads a pipe to the end on its own thread.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Trimmed stderr, falling back to stdout, falling back to the status.
fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    format!("exited with {}", output.status)
}

/// Extracts the job ID from `qsub -terse` output. Array jobs print
/// `<id>.<range>`; only the ID is kept.
fn parse_job_id(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|line| !line.is_empty())?;
    let id = line.split('.').next().unwrap_or(line);
    if id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

impl Scheduler for GridEngine {
    fn submit(&self, request: &SubmitRequest) -> Result<String, SchedulerError> {
        let mut cmd = Command::new(&self.qsub);
        cmd.arg("-terse")
            .arg("-N")
            .arg(&request.name)
            .arg("-wd")
            .arg(&request.working_dir)
            .arg("-o")
            .arg(&request.stdout)
            .arg("-e")
            .arg(&request.stderr)
            .args(["-S", "/bin/bash"])
            .args(&request.options)
            .arg(&request.script);
        debug!("Submitting: {:?}", cmd);

        let output = self.run(&self.qsub, &mut cmd, SchedulerError::Rejected)?;
        if !output.status.success() {
            return Err(SchedulerError::Rejected(failure_message(&output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_job_id(&stdout).ok_or_else(|| {
            SchedulerError::Rejected(format!("unexpected qsub output: '{}'", stdout.trim()))
        })
    }

    fn state(&self, job_id: &str) -> Result<ClusterState, SchedulerError> {
        let output = self.run(
            &self.qstat,
            Command::new(&self.qstat).args(["-j", job_id]),
            SchedulerError::Query,
        )?;
        if output.status.success() {
            return Ok(ClusterState::Active);
        }

        let message = failure_message(&output);
        if message.contains(UNKNOWN_JOB_MARKER) {
            Ok(ClusterState::Finished)
        } else {
            Err(SchedulerError::Query(message))
        }
    }

    fn kill(&self, job_id: &str) -> Result<(), SchedulerError> {
        let output = self.run(
            &self.qdel,
            Command::new(&self.qdel).arg(job_id),
            SchedulerError::Kill,
        )?;
        if output.status.success() {
            Ok(())
        } else {
            Err(SchedulerError::Kill(failure_message(&output)))
        }
    }
}
