//! Tool Version Resolution Module
//!
//! Chooses which installed version of an external tool a stage uses.
//!
//! - [`version`]: Versions, constraints and specs
//! - [`inventory`]: Installed tool versions
//! - [`resolver`]: Highest-matching selection and platform overrides

pub mod inventory;
pub mod resolver;
pub mod version;

pub use inventory::{InstalledTool, ToolInventory};
pub use resolver::{resolve, NoMatchingVersion, ToolRequirement, VersionResolver};
pub use version::{Operator, Version, VersionConstraint, VersionSpec};
