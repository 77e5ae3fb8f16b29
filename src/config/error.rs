//! Configuration Errors
//!
//! Everything that can be wrong with settings text is reported as a
//! [`ConfigError`] at load or parse time, never at dispatch time.

use std::path::PathBuf;

use thiserror::Error;

/// Malformed configuration: runner expressions, version syntax, or
/// unreadable settings and inventory files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid runner expression '{expr}': {reason}")]
    InvalidRunner { expr: String, reason: String },

    #[error("unknown runner '{name}' (expected SimpleJobRunner or GEJobRunner)")]
    UnknownBackend { name: String },

    #[error("invalid version '{token}': expected dot-separated non-negative integers")]
    InvalidVersion { token: String },

    #[error("unknown operator in version constraint '{constraint}'")]
    UnknownOperator { constraint: String },

    #[error("empty constraint in version spec '{spec}'")]
    EmptyConstraint { spec: String },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("{section}.{key}: {source}")]
    Setting {
        section: String,
        key: String,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

impl ConfigError {
    /// Attaches the `section.key` the offending value came from.
    pub fn in_setting(self, section: &str, key: &str) -> Self {
        ConfigError::Setting {
            section: section.to_string(),
            key: key.to_string(),
            source: Box::new(self),
        }
    }
}
