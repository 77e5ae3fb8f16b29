//! Configuration Module
//!
//! The settings snapshot handed to the core by the settings loader, plus
//! the error type for everything that can be malformed in it.
//!
//! - [`settings`]: Immutable section/key/value snapshot
//! - [`defaults`]: Ambient dispatch settings from the `general` section
//! - [`error`]: Load and parse errors

pub mod defaults;
pub mod error;
pub mod settings;

pub use defaults::{DispatchSettings, DEFAULT_LOG_DIR};
pub use error::ConfigError;
pub use settings::Configuration;
