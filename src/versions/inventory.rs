//! Tool Inventory
//!
//! The set of installed tool versions the resolver may choose from.
//! Inventories are snapshots: built once by a discovery step and then
//! only read.
//!
//! # JSON Format
//!
//! ```json
//! {
//!   "bcl2fastq": [
//!     "2.17.1.14",
//!     { "version": "2.20.0.422", "location": "/opt/bcl2fastq/2.20.0.422/bin" }
//!   ],
//!   "cellranger": ["3.1.0", "5.0.1"]
//! }
//! ```
//!
//! # Module Tree Layout
//!
//! [`ToolInventory::scan`] reads a tree laid out as `<root>/<tool>/<version>`
//! (the usual environment-modules layout). If `<version>/bin` exists it
//! becomes the tool location, otherwise a version directory itself is used.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use super::version::Version;
use crate::config::ConfigError;

/// One installed version of a tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstalledTool {
    /// Tool name, e.g. "bcl2fastq"
    pub name: String,
    /// Installed version
    pub version: Version,
    /// Directory holding the tool's executables, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
}

impl InstalledTool {
    /// Name of the environment variable announcing the selected version,
    /// e.g. `BCL2FASTQ_VERSION`.
    pub fn version_variable(&self) -> String {
        let stem: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_VERSION", stem)
    }
}

/// Inventory file entry: a bare version or a version with a location.
#[derive(Deserialize)]
#[serde(untagged)]
enum EntryRepr {
    Version(String),
    Located {
        version: String,
        #[serde(default)]
        location: Option<PathBuf>,
    },
}

/// Installed tool versions, keyed by tool name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolInventory {
    tools: BTreeMap<String, Vec<InstalledTool>>,
}

impl ToolInventory {
    /// Creates an empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an installed version.
    ///
    /// Adding a version numerically equal to one already present replaces
    /// the earlier entry.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        version: &str,
        location: Option<PathBuf>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        let version: Version = version.parse()?;
        let entries = self.tools.entry(name.clone()).or_default();

        entries.retain(|existing| existing.version != version);
        entries.push(InstalledTool {
            name,
            version,
            location,
        });
        entries.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(())
    }

    /// Builder form of [`add`](Self::add) without a location.
    ///
    /// ```
    /// use stagerun::versions::ToolInventory;
    ///
    /// let inventory = ToolInventory::new()
    ///     .with_tool("bcl2fastq", "2.17.1.14")?
    ///     .with_tool("bcl2fastq", "2.20.0.422")?;
    /// assert_eq!(inventory.versions("bcl2fastq").len(), 2);
    /// # Ok::<(), stagerun::config::ConfigError>(())
    /// ```
    pub fn with_tool(mut self, name: &str, version: &str) -> Result<Self, ConfigError> {
        self.add(name, version, None)?;
        Ok(self)
    }

    /// Installed versions of a tool, lowest first.
    pub fn versions(&self, name: &str) -> &[InstalledTool] {
        self.tools.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Names of all tools with at least one version.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Total number of installed versions.
    pub fn len(&self) -> usize {
        self.tools.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parses an inventory from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: BTreeMap<String, Vec<EntryRepr>> =
            serde_json::from_str(text).map_err(|e| ConfigError::InvalidValue {
                key: "inventory".to_string(),
                reason: e.to_string(),
            })?;

        let mut inventory = Self::new();
        for (name, entries) in raw {
            for entry in entries {
                let (version, location) = match entry {
                    EntryRepr::Version(version) => (version, None),
                    EntryRepr::Located { version, location } => (version, location),
                };
                inventory
                    .add(name.clone(), &version, location)
                    .map_err(|e| e.in_setting("inventory", &name))?;
            }
        }
        Ok(inventory)
    }

    /// Loads an inventory from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading tool inventory from: {}", path.display());

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let inventory = Self::from_json_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        debug!(
            "Inventory loaded: {} versions of {} tools",
            inventory.len(),
            inventory.tools.len()
        );
        Ok(inventory)
    }

    /// Builds an inventory from a `<root>/<tool>/<version>` tree.
    ///
    /// Hidden entries (such as a modules `.version` file) are skipped.
    /// Any other version entry that is not a dotted integer version is
    /// reported as an error rather than guessed at.
    pub fn scan(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        debug!("Scanning tool inventory under: {}", root.display());

        let mut inventory = Self::new();

        for tool_dir in sorted_entries(root)? {
            if !tool_dir.is_dir() {
                continue;
            }
            let Some(tool) = visible_name(&tool_dir) else {
                continue;
            };

            for version_path in sorted_entries(&tool_dir)? {
                let Some(version) = visible_name(&version_path) else {
                    continue;
                };

                let bin_dir = version_path.join("bin");
                let location = if bin_dir.is_dir() {
                    Some(bin_dir)
                } else if version_path.is_dir() {
                    Some(version_path.clone())
                } else {
                    None
                };

                inventory
                    .add(tool.clone(), &version, location)
                    .map_err(|e| ConfigError::Parse {
                        path: version_path.clone(),
                        message: e.to_string(),
                    })?;
                debug!("Found {} {}", tool, version);
            }
        }

        debug!("Found {} installed tool versions", inventory.len());
        Ok(inventory)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let io_error = |source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut paths = fs::read_dir(dir)
        .map_err(io_error)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error)?;
    paths.sort();
    Ok(paths)
}

fn visible_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.starts_with('.'))
        .map(str::to_string)
}
