//! Job Runners Module
//!
//! How a stage's command gets executed.
//!
//! - [`spec`]: Runner expressions such as `GEJobRunner(-pe smp.pe 8)`
//! - [`registry`]: Per-stage runner selection from configuration
//! - [`job`]: Jobs, handles and the [`JobRunner`] trait
//! - [`local`]: Local subprocess backend
//! - [`cluster`]: Batch scheduler backend
//! - [`gridengine`]: Grid Engine scheduler commands
//! - [`script`]: Job script generation

pub mod cluster;
pub mod gridengine;
pub mod job;
pub mod local;
pub mod registry;
pub mod script;
pub mod spec;

pub use cluster::{ClusterRunner, ClusterState, Scheduler, SchedulerError, SubmitRequest};
pub use gridengine::GridEngine;
pub use job::{CancelFlag, Job, JobCommand, JobHandle, JobLogs, JobOutcome, JobRunner};
pub use local::LocalRunner;
pub use registry::RunnerRegistry;
pub use spec::{BackendKind, RunnerSpec};
