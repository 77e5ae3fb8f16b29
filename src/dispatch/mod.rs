//! Stage Dispatch Module
//!
//! Ties runner selection, tool version resolution and the job runners
//! together behind one call per stage.
//!
//! - [`dispatcher`]: The [`Dispatcher`] and its per-call options
//! - [`result`]: What a dispatch reports back

pub mod dispatcher;
pub mod result;

pub use dispatcher::{
    DispatchOptions, Dispatcher, PreparedJob, RunContext, RunningStage, StageCanceller,
};
pub use result::{DispatchResult, JobStatus};
