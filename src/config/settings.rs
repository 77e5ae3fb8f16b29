//! Settings Snapshot
//!
//! An immutable, already-parsed view of the pipeline settings: section
//! name to key/value strings. The core never re-reads or mutates it; a
//! changed settings file means building a new snapshot.
//!
//! # Example YAML Format
//!
//! ```yaml
//! general:
//!   default_runner: SimpleJobRunner
//!   poll_interval: 5
//! runners:
//!   bcl2fastq: GEJobRunner(-pe smp.pe 8)
//!   qc: GEJobRunner(-l short)
//! bcl2fastq:
//!   default_version: ">=2.17"
//! "platform:nextseq":
//!   bcl2fastq: ">=2.20"
//! sequencers:
//!   NB500968: nextseq
//! ```
//!
//! Version strings with a single dot (`2.20`) must be quoted in YAML,
//! otherwise they are read as floating point numbers and `2.20` would
//! become `2.2`. Unquoted fractional numbers are therefore rejected
//! everywhere except in `general`, whose numeric keys are durations.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::debug;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::error::ConfigError;

type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// Prefix of sections holding per-platform tool version specs.
pub const PLATFORM_PREFIX: &str = "platform:";

/// Section whose values may be unquoted fractional numbers.
const NUMERIC_SECTION: &str = "general";

/// Immutable settings snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    #[serde(deserialize_with = "scalar_sections")]
    sections: Sections,
}

/// Deserializes a mapping of mappings, stringifying scalar values.
fn scalar_sections<'de, D>(deserializer: D) -> Result<Sections, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Option<BTreeMap<String, Value>>> =
        BTreeMap::deserialize(deserializer)?;

    raw.into_iter()
        .map(|(section, keys)| {
            let keys = keys
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| match value {
                    Value::Number(n) if n.is_f64() && section != NUMERIC_SECTION => {
                        Err(de::Error::custom(format!(
                            "{}.{}: unquoted number {} may have lost digits, quote it",
                            section, key, n
                        )))
                    }
                    value => match scalar_to_string(value) {
                        Some(text) => Ok((key, text)),
                        None => Err(de::Error::custom(format!(
                            "{}.{}: expected a scalar value",
                            section, key
                        ))),
                    },
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Ok((section, keys))
        })
        .collect()
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s),
        _ => None,
    }
}

impl Configuration {
    /// Creates an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a value while building a snapshot.
    ///
    /// ```
    /// use stagerun::config::Configuration;
    ///
    /// let config = Configuration::new()
    ///     .with_value("general", "default_runner", "SimpleJobRunner")
    ///     .with_value("runners", "bcl2fastq", "GEJobRunner(-pe smp.pe 8)");
    /// assert_eq!(config.get("runners", "bcl2fastq"), Some("GEJobRunner(-pe smp.pe 8)"));
    /// ```
    pub fn with_value(
        mut self,
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.sections
            .entry(section.into())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    /// Parses a snapshot from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        serde_yaml::from_str(text)
    }

    /// Loads a snapshot from a YAML settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading settings from: {}", path.display());

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        debug!("Settings loaded: {} sections", config.sections.len());
        Ok(config)
    }

    /// Looks up a single value. Empty values count as absent.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|keys| keys.get(key))
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Returns all keys of a section.
    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(name)
    }

    /// Iterates over sections in name order.
    pub fn sections(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.sections
            .iter()
            .map(|(name, keys)| (name.as_str(), keys))
    }

    /// Iterates over `platform:<name>` sections as `(name, keys)`.
    pub fn platforms(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, String>)> {
        self.sections().filter_map(|(name, keys)| {
            name.strip_prefix(PLATFORM_PREFIX)
                .map(|platform| (platform, keys))
        })
    }

    /// Maps an instrument name to its platform via the `sequencers` section.
    pub fn platform_for_instrument(&self, instrument: &str) -> Option<&str> {
        self.get("sequencers", instrument)
    }

    /// Returns true if the snapshot has no sections.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_get() {
        let config = Configuration::new()
            .with_value("general", "default_runner", "SimpleJobRunner")
            .with_value("general", "poll_interval", "2");

        assert_eq!(config.get("general", "default_runner"), Some("SimpleJobRunner"));
        assert_eq!(config.get("general", "poll_interval"), Some("2"));
        assert_eq!(config.get("general", "missing"), None);
        assert_eq!(config.get("missing", "default_runner"), None);
    }

    #[test]
    fn test_empty_value_is_absent() {
        let config = Configuration::new().with_value("runners", "qc", "  ");
        assert_eq!(config.get("runners", "qc"), None);
    }

    #[test]
    fn test_from_yaml_str() {
        let yaml = r#"
general:
  default_runner: SimpleJobRunner
  poll_interval: 5
runners:
  bcl2fastq: GEJobRunner(-pe smp.pe 8)
"platform:nextseq":
  bcl2fastq: ">=2.20"
sequencers:
  NB500968: nextseq
"#;
        let config = Configuration::from_yaml_str(yaml).unwrap();

        assert_eq!(config.get("general", "poll_interval"), Some("5"));
        assert_eq!(
            config.get("runners", "bcl2fastq"),
            Some("GEJobRunner(-pe smp.pe 8)")
        );
        assert_eq!(config.get("platform:nextseq", "bcl2fastq"), Some(">=2.20"));
    }

    #[test]
    fn test_from_yaml_empty_section() {
        let config = Configuration::from_yaml_str("runners:\n").unwrap();
        assert!(config.section("runners").unwrap().is_empty());
    }

    #[test]
    fn test_from_yaml_rejects_nested_values() {
        let result = Configuration::from_yaml_str("runners:\n  qc:\n    - a\n    - b\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_yaml_rejects_unquoted_fractional_version() {
        let err = Configuration::from_yaml_str("bcl2fastq:\n  default_version: 2.20\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("bcl2fastq.default_version"), "{}", err);
        assert!(err.contains("quote"), "{}", err);

        let result = Configuration::from_yaml_str("\"platform:nextseq\":\n  bcl2fastq: 2.20\n");
        assert!(result.is_err());

        let config = Configuration::from_yaml_str("bcl2fastq:\n  default_version: \"2.20\"\n")
            .unwrap();
        assert_eq!(config.get("bcl2fastq", "default_version"), Some("2.20"));
    }

    #[test]
    fn test_from_yaml_accepts_fractional_general_values() {
        let config = Configuration::from_yaml_str("general:\n  poll_interval: 0.5\n").unwrap();
        assert_eq!(config.get("general", "poll_interval"), Some("0.5"));
    }

    #[test]
    fn test_load_unquoted_version_is_parse_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.yaml");
        fs::write(&path, "bcl2fastq:\n  default_version: 2.20\n").unwrap();

        match Configuration::load(&path) {
            Err(ConfigError::Parse { message, .. }) => {
                assert!(message.contains("bcl2fastq.default_version"), "{}", message)
            }
            other => panic!("expected a parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_yaml_blank_text() {
        let config = Configuration::from_yaml_str("   \n").unwrap();
        assert!(config.is_empty());
    }

    #[test]
    fn test_platforms() {
        let config = Configuration::new()
            .with_value("platform:nextseq", "bcl2fastq", ">=2.20")
            .with_value("platform:miseq", "bcl2fastq", "2.17.1.14")
            .with_value("bcl2fastq", "default_version", ">=2.17");

        let names: Vec<&str> = config.platforms().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["miseq", "nextseq"]);
    }

    #[test]
    fn test_platform_for_instrument() {
        let config = Configuration::new()
            .with_value("sequencers", "NB500968", "nextseq")
            .with_value("sequencers", "M00879", "miseq");

        assert_eq!(config.platform_for_instrument("NB500968"), Some("nextseq"));
        assert_eq!(config.platform_for_instrument("M00879"), Some("miseq"));
        assert_eq!(config.platform_for_instrument("K00311"), None);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Configuration::load("/nonexistent/settings.yaml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.yaml");
        fs::write(&path, "this is not valid yaml: [[[").unwrap();

        let result = Configuration::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_valid_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("settings.yaml");
        fs::write(&path, "general:\n  default_runner: GEJobRunner(-q all.q)\n").unwrap();

        let config = Configuration::load(&path).unwrap();
        assert_eq!(config.get("general", "default_runner"), Some("GEJobRunner(-q all.q)"));
    }
}
