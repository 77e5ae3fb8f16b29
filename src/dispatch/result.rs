//! Dispatch Results
//!
//! What a stage gets back from the dispatcher. Every dispatch produces a
//! [`DispatchResult`], including ones that never reached a backend.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::error::DispatchError;
use crate::runners::{JobOutcome, RunnerSpec};
use crate::versions::InstalledTool;

/// Final state of a dispatched stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "exit_code", rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    /// Ran and failed; the exit code is absent when killed by a signal or
    /// when a cluster job never recorded one.
    Failed(Option<i32>),
    Cancelled,
    SubmissionFailed,
    NoMatchingVersion,
}

impl JobStatus {
    pub fn is_success(self) -> bool {
        self == JobStatus::Success
    }

    fn from_outcome(outcome: &Result<JobOutcome, DispatchError>) -> Self {
        match outcome {
            Ok(JobOutcome::Completed) => JobStatus::Success,
            Ok(JobOutcome::Cancelled) => JobStatus::Cancelled,
            Err(DispatchError::Execution { exit_code, .. }) => JobStatus::Failed(*exit_code),
            Err(DispatchError::Submission { .. }) => JobStatus::SubmissionFailed,
            Err(DispatchError::NoMatchingVersion { .. }) => JobStatus::NoMatchingVersion,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed(Some(code)) => write!(f, "failed (exit code {})", code),
            JobStatus::Failed(None) => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::SubmissionFailed => write!(f, "submission failed"),
            JobStatus::NoMatchingVersion => write!(f, "no matching version"),
        }
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub stage: String,
    pub status: JobStatus,
    /// Runner the stage resolved to
    pub runner: Option<RunnerSpec>,
    /// Tool version selected for the stage, if it required one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<InstalledTool>,
    /// Process ID or scheduler job ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    #[serde(rename = "elapsed_secs", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    /// One-line summary
    pub message: String,
    #[serde(skip)]
    pub error: Option<DispatchError>,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Exit code of a job that ran and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self.status {
            JobStatus::Failed(code) => code,
            JobStatus::Success => Some(0),
            _ => None,
        }
    }
}

fn serialize_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// Collects what is known about a dispatch as it progresses.
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub stage: String,
    pub runner: Option<RunnerSpec>,
    pub tool: Option<InstalledTool>,
    pub started_at: DateTime<Utc>,
    start: std::time::Instant,
}

impl Attempt {
    pub fn begin(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            runner: None,
            tool: None,
            started_at: Utc::now(),
            start: std::time::Instant::now(),
        }
    }

    /// Closes the attempt. `job` is the job ID and log paths, if the job
    /// was submitted.
    pub fn finish(
        self,
        job: Option<(String, PathBuf, PathBuf)>,
        outcome: Result<JobOutcome, DispatchError>,
    ) -> DispatchResult {
        let elapsed = self.start.elapsed();
        let status = JobStatus::from_outcome(&outcome);
        let message = match &outcome {
            Ok(JobOutcome::Completed) => {
                format!("stage '{}' completed in {:.2?}", self.stage, elapsed)
            }
            Ok(JobOutcome::Cancelled) => {
                format!("stage '{}' cancelled after {:.2?}", self.stage, elapsed)
            }
            Err(e) => e.to_string(),
        };
        let (job_id, stdout, stderr) = match job {
            Some((id, stdout, stderr)) => (Some(id), Some(stdout), Some(stderr)),
            None => (None, None, None),
        };

        DispatchResult {
            stage: self.stage,
            status,
            runner: self.runner,
            tool: self.tool,
            job_id,
            stdout,
            stderr,
            elapsed,
            started_at: self.started_at,
            message,
            error: outcome.err(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_outcome() {
        assert_eq!(
            JobStatus::from_outcome(&Ok(JobOutcome::Completed)),
            JobStatus::Success
        );
        assert_eq!(
            JobStatus::from_outcome(&Ok(JobOutcome::Cancelled)),
            JobStatus::Cancelled
        );
        assert_eq!(
            JobStatus::from_outcome(&Err(DispatchError::Execution {
                stage: "qc".into(),
                exit_code: Some(2),
                stderr_tail: String::new(),
            })),
            JobStatus::Failed(Some(2))
        );
        assert_eq!(
            JobStatus::from_outcome(&Err(DispatchError::submission("qc", "queue full"))),
            JobStatus::SubmissionFailed
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(JobStatus::Failed(Some(1)).to_string(), "failed (exit code 1)");
        assert_eq!(JobStatus::NoMatchingVersion.to_string(), "no matching version");
    }

    #[test]
    fn test_finish_without_job() {
        let mut attempt = Attempt::begin("make_fastqs");
        attempt.runner = Some(RunnerSpec::local());
        let result = attempt.finish(None, Err(DispatchError::submission("make_fastqs", "no qsub")));

        assert_eq!(result.status, JobStatus::SubmissionFailed);
        assert!(result.stdout.is_none());
        assert!(result.job_id.is_none());
        assert!(result.message.contains("no qsub"));
        assert!(result.error.is_some());
        assert_eq!(result.exit_code(), None);
    }

    #[test]
    fn test_serialized_form() {
        let mut attempt = Attempt::begin("qc");
        attempt.runner = Some(RunnerSpec::cluster("-q all.q"));
        let result = attempt.finish(
            Some(("4242".into(), "/logs/qc.out".into(), "/logs/qc.err".into())),
            Err(DispatchError::Execution {
                stage: "qc".into(),
                exit_code: Some(1),
                stderr_tail: "fastqc: out of memory".into(),
            }),
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["stage"], "qc");
        assert_eq!(value["status"]["state"], "failed");
        assert_eq!(value["status"]["exit_code"], 1);
        assert_eq!(value["runner"], "GEJobRunner(-q all.q)");
        assert_eq!(value["job_id"], "4242");
        assert_eq!(value["stderr"], "/logs/qc.err");
        assert!(value["elapsed_secs"].is_number());
        assert!(value.get("error").is_none());
        assert!(value.get("tool").is_none());
    }
}
