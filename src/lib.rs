//! stagerun - Stage Dispatch for Sequencing Pipelines
//!
//! Runs the external commands of sequencing pipeline stages, either as
//! local subprocesses or as Grid Engine jobs, and picks which installed
//! version of a tool (e.g. `bcl2fastq`) each stage uses.
//!
//! # Architecture
//!
//! - [`config`]: Settings snapshot and ambient dispatch settings
//! - [`versions`]: Version specs, tool inventory and version resolution
//! - [`runners`]: Runner selection and the local/cluster job runners
//! - [`dispatch`]: The per-stage entry point tying it all together
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use stagerun::{Configuration, DispatchOptions, Dispatcher, RunContext, ToolInventory};
//! use stagerun::runners::JobCommand;
//! use stagerun::versions::ToolRequirement;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Configuration::load("settings.yaml")?);
//!     let inventory = Arc::new(ToolInventory::scan("/opt/apps")?);
//!     let dispatcher = Dispatcher::new(config, inventory, RunContext::with_platform("nextseq"))?;
//!
//!     let options = DispatchOptions::new()
//!         .with_tool(ToolRequirement::new("bcl2fastq", ">=2.17")?)
//!         .in_directory("/data/171020_NB500968_00002_AHGXXXX");
//!     let result = dispatcher.dispatch(
//!         "make_fastqs",
//!         JobCommand::new("bcl2fastq").args(["--runfolder-dir", "."]),
//!         options,
//!     );
//!     println!("{}", result.message);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod runners;
pub mod versions;

// Re-export commonly used types
pub use config::{ConfigError, Configuration};
pub use dispatch::{DispatchOptions, DispatchResult, Dispatcher, JobStatus, RunContext};
pub use error::DispatchError;
pub use runners::{JobCommand, RunnerSpec};
pub use versions::{ToolInventory, ToolRequirement, VersionSpec};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "stagerun";
