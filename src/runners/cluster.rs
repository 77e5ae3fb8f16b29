//! Cluster Job Runner
//!
//! Submits jobs to a batch scheduler as generated bash scripts and polls
//! the scheduler until the job leaves the queue. The script records the
//! command's exit status in a `.status` file, which decides the outcome.
//!
//! The scheduler itself sits behind the [`Scheduler`] trait; the
//! production implementation is [`GridEngine`](super::gridengine::GridEngine).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use super::gridengine::GridEngine;
use super::job::{
    foreign_handle, log_tail, sanitize_name, Job, JobHandle, JobLogs, JobOutcome, JobRunner,
    STDERR_TAIL_LINES,
};
use super::script::create_job_script;
use crate::config::DispatchSettings;
use crate::error::DispatchError;

/// What a scheduler is asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Job name shown in the queue
    pub name: String,
    pub working_dir: PathBuf,
    /// Bash script to execute
    pub script: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Scheduler options taken from the runner argument string
    pub options: Vec<String>,
}

/// Whether a submitted job is still known to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Queued, running or held
    Active,
    /// No longer in the queue
    Finished,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job rejected by scheduler: {0}")]
    Rejected(String),

    #[error("status query failed: {0}")]
    Query(String),

    #[error("kill request failed: {0}")]
    Kill(String),

    #[error("failed to run {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// A batch scheduler front end.
pub trait Scheduler: Send + Sync {
    /// Submits a script, returning the scheduler's job ID.
    fn submit(&self, request: &SubmitRequest) -> Result<String, SchedulerError>;

    fn state(&self, job_id: &str) -> Result<ClusterState, SchedulerError>;

    fn kill(&self, job_id: &str) -> Result<(), SchedulerError>;
}

/// Backend state of a cluster job.
struct ClusterJob {
    status_file: PathBuf,
}

/// Runs jobs through a [`Scheduler`].
#[derive(Clone)]
pub struct ClusterRunner {
    scheduler: Arc<dyn Scheduler>,
    log_dir: PathBuf,
    poll_interval: Duration,
    max_poll_retries: u32,
}

impl ClusterRunner {
    pub fn new(scheduler: Arc<dyn Scheduler>, settings: &DispatchSettings) -> Self {
        Self {
            scheduler,
            log_dir: settings.log_dir.clone(),
            poll_interval: settings.poll_interval,
            max_poll_retries: settings.max_poll_retries,
        }
    }

    /// A runner submitting through the `qsub`/`qstat`/`qdel` on `PATH`.
    pub fn grid_engine(settings: &DispatchSettings) -> Self {
        let engine = GridEngine::default().with_timeout(settings.scheduler_timeout);
        Self::new(Arc::new(engine), settings)
    }

    fn finished(handle: &JobHandle, status_file: &Path) -> Result<JobOutcome, DispatchError> {
        if handle.is_cancelled() {
            return Ok(JobOutcome::Cancelled);
        }

        let exit_code = read_exit_status(status_file);
        debug!(
            "Cluster job {} for stage '{}' left the queue, exit status {:?}",
            handle.id(),
            handle.stage(),
            exit_code
        );

        match exit_code {
            Some(0) => Ok(JobOutcome::Completed),
            exit_code => Err(DispatchError::Execution {
                stage: handle.stage().to_string(),
                exit_code,
                stderr_tail: log_tail(&handle.logs().stderr, STDERR_TAIL_LINES),
            }),
        }
    }
}

impl std::fmt::Debug for ClusterRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRunner")
            .field("log_dir", &self.log_dir)
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_retries", &self.max_poll_retries)
            .finish()
    }
}

/// Exit status written by the job script, if it got that far.
fn read_exit_status(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

impl JobRunner for ClusterRunner {
    fn submit(&self, job: Job) -> Result<JobHandle, DispatchError> {
        let stage = job.stage.as_str();

        let logs = JobLogs::allocate(&self.log_dir, stage).map_err(|e| {
            DispatchError::submission(
                stage,
                format!("cannot create logs in {}: {}", self.log_dir.display(), e),
            )
        })?;
        let script = logs.sibling("sh");
        let status_file = logs.sibling("status");

        create_job_script(&job, &script, &status_file).map_err(|e| {
            DispatchError::submission(
                stage,
                format!("cannot write job script {}: {}", script.display(), e),
            )
        })?;

        let request = SubmitRequest {
            name: sanitize_name(stage),
            working_dir: job.working_dir.clone(),
            script,
            stdout: logs.stdout.clone(),
            stderr: logs.stderr.clone(),
            options: job.runner.arg_list(),
        };

        let job_id = self
            .scheduler
            .submit(&request)
            .map_err(|e| DispatchError::submission(stage, e.to_string()))?;

        debug!(
            "Stage '{}' submitted as cluster job {} (options: {:?}): {}",
            stage, job_id, request.options, job.command
        );

        Ok(JobHandle::new(
            job.stage,
            job_id,
            logs,
            ClusterJob { status_file },
        ))
    }

    fn wait(&self, handle: &JobHandle) -> Result<JobOutcome, DispatchError> {
        let job = handle
            .state::<ClusterJob>()
            .ok_or_else(|| foreign_handle(handle))?;
        let mut failures = 0u32;

        loop {
            if handle.is_cancelled() {
                return Ok(JobOutcome::Cancelled);
            }

            match self.scheduler.state(handle.id()) {
                Ok(ClusterState::Finished) => return Self::finished(handle, &job.status_file),
                Ok(ClusterState::Active) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures > self.max_poll_retries {
                        return Err(DispatchError::submission(
                            handle.stage(),
                            format!(
                                "lost track of cluster job {} after {} failed status queries: {}",
                                handle.id(),
                                failures,
                                e
                            ),
                        ));
                    }
                    debug!(
                        "Status query for cluster job {} failed ({}/{}): {}",
                        handle.id(),
                        failures,
                        self.max_poll_retries,
                        e
                    );
                }
            }

            if handle.cancel_flag().wait_timeout(self.poll_interval) {
                return Ok(JobOutcome::Cancelled);
            }
        }
    }

    fn cancel(&self, handle: &JobHandle) {
        handle.cancel_flag().cancel();

        if handle.state::<ClusterJob>().is_none() {
            warn!("Cannot cancel job {}: not a cluster job", handle.id());
            return;
        }

        debug!("Deleting cluster job {} ({})", handle.id(), handle.stage());
        if let Err(e) = self.scheduler.kill(handle.id()) {
            warn!("Failed to delete cluster job {}: {}", handle.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::job::JobCommand;
    use crate::runners::spec::RunnerSpec;
    use std::collections::{BTreeMap, VecDeque};
    use std::fs::File;
    use std::process::Command;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    /// In-process scheduler that optionally runs the script on submit and
    /// then replays scripted status answers.
    struct FakeScheduler {
        run_on_submit: bool,
        reject: bool,
        fail_kill: bool,
        answers: Mutex<VecDeque<Result<ClusterState, SchedulerError>>>,
        fallback: ClusterState,
        submitted: Mutex<Vec<SubmitRequest>>,
        killed: Mutex<Vec<String>>,
    }

    impl FakeScheduler {
        fn new() -> Self {
            Self {
                run_on_submit: true,
                reject: false,
                fail_kill: false,
                answers: Mutex::new(VecDeque::new()),
                fallback: ClusterState::Finished,
                submitted: Mutex::new(Vec::new()),
                killed: Mutex::new(Vec::new()),
            }
        }

        fn answering(self, answers: Vec<Result<ClusterState, SchedulerError>>) -> Self {
            *self.answers.lock().unwrap() = answers.into();
            self
        }
    }

    impl Scheduler for FakeScheduler {
        fn submit(&self, request: &SubmitRequest) -> Result<String, SchedulerError> {
            if self.reject {
                return Err(SchedulerError::Rejected("Unable to run job: queue disabled".into()));
            }
            if self.run_on_submit {
                Command::new("bash")
                    .arg(&request.script)
                    .current_dir(&request.working_dir)
                    .stdout(File::create(&request.stdout).unwrap())
                    .stderr(File::create(&request.stderr).unwrap())
                    .status()
                    .unwrap();
            }
            let mut submitted = self.submitted.lock().unwrap();
            submitted.push(request.clone());
            Ok(format!("{}", 1000 + submitted.len()))
        }

        fn state(&self, _job_id: &str) -> Result<ClusterState, SchedulerError> {
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(self.fallback))
        }

        fn kill(&self, job_id: &str) -> Result<(), SchedulerError> {
            self.killed.lock().unwrap().push(job_id.to_string());
            if self.fail_kill {
                Err(SchedulerError::Kill("qdel: denied".into()))
            } else {
                Ok(())
            }
        }
    }

    fn runner(temp_dir: &TempDir, scheduler: Arc<FakeScheduler>) -> ClusterRunner {
        let settings = DispatchSettings::default()
            .with_log_dir(temp_dir.path().join("logs"))
            .with_poll_interval(Duration::from_millis(10));
        ClusterRunner::new(scheduler, &settings)
    }

    fn job(temp_dir: &TempDir, script: &str) -> Job {
        Job {
            stage: "make_fastqs".to_string(),
            command: JobCommand::new("bash").args(["-c", script]),
            working_dir: temp_dir.path().to_path_buf(),
            runner: RunnerSpec::cluster("-pe smp.pe 8"),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn test_successful_job() {
        let temp_dir = tempdir().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        let runner = runner(&temp_dir, Arc::clone(&scheduler));

        let handle = runner.submit(job(&temp_dir, "echo demultiplexed")).unwrap();
        assert_eq!(runner.wait(&handle).unwrap(), JobOutcome::Completed);

        let submitted = scheduler.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].name, "make_fastqs");
        assert_eq!(submitted[0].options, vec!["-pe", "smp.pe", "8"]);
        assert!(submitted[0].script.exists());
        assert_eq!(
            fs::read_to_string(&handle.logs().stdout).unwrap().trim(),
            "demultiplexed"
        );
    }

    #[test]
    fn test_failed_job_reports_exit_status_and_stderr() {
        let temp_dir = tempdir().unwrap();
        let runner = runner(&temp_dir, Arc::new(FakeScheduler::new()));

        let handle = runner
            .submit(job(&temp_dir, "echo 'Lane 3 missing' >&2; exit 3"))
            .unwrap();

        match runner.wait(&handle).unwrap_err() {
            DispatchError::Execution {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr_tail.contains("Lane 3 missing"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_status_file_is_execution_error_without_code() {
        let temp_dir = tempdir().unwrap();
        let mut scheduler = FakeScheduler::new();
        scheduler.run_on_submit = false;
        let runner = runner(&temp_dir, Arc::new(scheduler));

        let handle = runner.submit(job(&temp_dir, "true")).unwrap();
        assert!(matches!(
            runner.wait(&handle),
            Err(DispatchError::Execution { exit_code: None, .. })
        ));
    }

    #[test]
    fn test_rejected_submission() {
        let temp_dir = tempdir().unwrap();
        let mut scheduler = FakeScheduler::new();
        scheduler.reject = true;
        let runner = runner(&temp_dir, Arc::new(scheduler));

        match runner.submit(job(&temp_dir, "true")).unwrap_err() {
            DispatchError::Submission { message, .. } => {
                assert!(message.contains("queue disabled"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_transient_query_errors_are_retried() {
        let temp_dir = tempdir().unwrap();
        let scheduler = FakeScheduler::new().answering(vec![
            Err(SchedulerError::Query("qmaster timeout".into())),
            Err(SchedulerError::Query("qmaster timeout".into())),
            Ok(ClusterState::Active),
            Err(SchedulerError::Query("qmaster timeout".into())),
            Err(SchedulerError::Query("qmaster timeout".into())),
            Err(SchedulerError::Query("qmaster timeout".into())),
            Ok(ClusterState::Finished),
        ]);
        let runner = runner(&temp_dir, Arc::new(scheduler));

        let handle = runner.submit(job(&temp_dir, "true")).unwrap();
        assert_eq!(runner.wait(&handle).unwrap(), JobOutcome::Completed);
    }

    #[test]
    fn test_persistent_query_errors_escalate() {
        let temp_dir = tempdir().unwrap();
        let scheduler = FakeScheduler::new().answering(
            (0..4)
                .map(|_| Err(SchedulerError::Query("qmaster down".into())))
                .collect(),
        );
        let runner = runner(&temp_dir, Arc::new(scheduler));

        let handle = runner.submit(job(&temp_dir, "true")).unwrap();
        match runner.wait(&handle).unwrap_err() {
            DispatchError::Submission { message, .. } => {
                assert!(message.contains("qmaster down"))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_cancel_wakes_waiter_and_deletes_job() {
        let temp_dir = tempdir().unwrap();
        let mut scheduler = FakeScheduler::new();
        scheduler.run_on_submit = false;
        scheduler.fallback = ClusterState::Active;
        let scheduler = Arc::new(scheduler);

        let settings = DispatchSettings::default()
            .with_log_dir(temp_dir.path().join("logs"))
            .with_poll_interval(Duration::from_secs(30));
        let runner = Arc::new(ClusterRunner::new(
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            &settings,
        ));

        let handle = runner.submit(job(&temp_dir, "sleep 600")).unwrap();
        let canceller = {
            let runner = Arc::clone(&runner);
            let handle = handle.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                runner.cancel(&handle);
            })
        };

        let start = Instant::now();
        assert_eq!(runner.wait(&handle).unwrap(), JobOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
        canceller.join().unwrap();

        assert_eq!(*scheduler.killed.lock().unwrap(), vec![handle.id().to_string()]);
    }

    #[test]
    fn test_failed_kill_still_terminates_handle() {
        let temp_dir = tempdir().unwrap();
        let mut scheduler = FakeScheduler::new();
        scheduler.run_on_submit = false;
        scheduler.fail_kill = true;
        scheduler.fallback = ClusterState::Active;
        let runner = runner(&temp_dir, Arc::new(scheduler));

        let handle = runner.submit(job(&temp_dir, "sleep 600")).unwrap();
        runner.cancel(&handle);

        assert!(handle.is_cancelled());
        assert_eq!(runner.wait(&handle).unwrap(), JobOutcome::Cancelled);
    }

    #[test]
    fn test_read_exit_status() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("job.status");

        assert_eq!(read_exit_status(&path), None);
        fs::write(&path, "0\n").unwrap();
        assert_eq!(read_exit_status(&path), Some(0));
        fs::write(&path, "137\n").unwrap();
        assert_eq!(read_exit_status(&path), Some(137));
        fs::write(&path, "").unwrap();
        assert_eq!(read_exit_status(&path), None);
    }
}
