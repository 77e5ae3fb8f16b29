//! Dispatch Errors
//!
//! Runtime failures of a dispatched stage. Malformed settings are a
//! [`ConfigError`](crate::config::ConfigError) instead and are reported
//! before anything is dispatched.

use thiserror::Error;

use crate::versions::NoMatchingVersion;

/// Why a dispatched stage did not complete successfully.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No installed tool version satisfies the stage's requirement.
    #[error("stage '{stage}': {source}")]
    NoMatchingVersion {
        stage: String,
        #[source]
        source: NoMatchingVersion,
    },

    /// The job never started: the scheduler rejected it, the process
    /// could not be spawned, or the scheduler stopped answering.
    #[error("stage '{stage}': submission failed: {message}")]
    Submission { stage: String, message: String },

    /// The job ran and failed.
    #[error("stage '{stage}': {}", describe_failure(.exit_code, .stderr_tail))]
    Execution {
        stage: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },
}

impl DispatchError {
    pub fn submission(stage: &str, message: impl Into<String>) -> Self {
        DispatchError::Submission {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Stage the failure belongs to.
    pub fn stage(&self) -> &str {
        match self {
            DispatchError::NoMatchingVersion { stage, .. }
            | DispatchError::Submission { stage, .. }
            | DispatchError::Execution { stage, .. } => stage,
        }
    }
}

fn describe_failure(exit_code: &Option<i32>, stderr_tail: &str) -> String {
    let status = match exit_code {
        Some(code) => format!("exited with status {}", code),
        None => "terminated without an exit status".to_string(),
    };

    match stderr_tail.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(last) => format!("{}: {}", status, last.trim()),
        None => status,
    }
}
