//! Version Resolution
//!
//! Picks the highest installed version of a tool that satisfies a
//! [`VersionSpec`], and works out which spec applies to a tool on a
//! given sequencing platform.
//!
//! # Configured Spec Lookup
//!
//! For a tool on platform `P` the first hit wins:
//!
//! 1. `platform:P` section, key `<tool>`
//! 2. `<tool>` section, key `default_version`
//! 3. nothing configured (any version)
//!
//! A stage's own requirement is combined with the configured spec; both
//! must hold.

use std::collections::BTreeMap;

use log::debug;
use thiserror::Error;

use super::inventory::{InstalledTool, ToolInventory};
use super::version::VersionSpec;
use crate::config::settings::PLATFORM_PREFIX;
use crate::config::{ConfigError, Configuration};

/// Sections whose keys never name a tool.
const RESERVED_SECTIONS: &[&str] = &["general", "runners", "sequencers"];

/// Key holding a tool's default version spec in its own section.
const DEFAULT_VERSION_KEY: &str = "default_version";

type SpecLookup =
    for<'a> fn(&'a VersionResolver, &str, Option<&str>) -> Option<&'a VersionSpec>;

/// Configured spec sources, most specific first.
const SPEC_LOOKUPS: [SpecLookup; 2] = [VersionResolver::platform_spec, VersionResolver::default_spec];

/// No installed version satisfies the spec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no installed version of '{tool}' satisfies {}", describe_spec(.spec))]
pub struct NoMatchingVersion {
    pub tool: String,
    pub spec: String,
}

fn describe_spec(spec: &str) -> String {
    if spec.is_empty() {
        "any version (none installed)".to_string()
    } else {
        format!("'{}'", spec)
    }
}

/// Selects the highest version of `tool` in `inventory` matching `spec`.
///
/// ```
/// use stagerun::versions::{resolve, ToolInventory, VersionSpec};
///
/// let inventory = ToolInventory::new()
///     .with_tool("bcl2fastq", "1.8.4")?
///     .with_tool("bcl2fastq", "2.20.0.422")?;
/// let spec: VersionSpec = "<2.0".parse()?;
///
/// let chosen = resolve("bcl2fastq", &spec, &inventory).unwrap();
/// assert_eq!(chosen.version.as_str(), "1.8.4");
/// # Ok::<(), stagerun::config::ConfigError>(())
/// ```
pub fn resolve<'a>(
    tool: &str,
    spec: &VersionSpec,
    inventory: &'a ToolInventory,
) -> Result<&'a InstalledTool, NoMatchingVersion> {
    inventory
        .versions(tool)
        .iter()
        .filter(|installed| spec.matches(&installed.version))
        .max_by(|a, b| a.version.cmp(&b.version))
        .ok_or_else(|| NoMatchingVersion {
            tool: tool.to_string(),
            spec: spec.to_string(),
        })
}

/// A stage's declared need for a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequirement {
    pub tool: String,
    pub spec: VersionSpec,
}

impl ToolRequirement {
    /// Parses the spec eagerly so malformed text fails before dispatch.
    pub fn new(tool: impl Into<String>, spec: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            tool: tool.into(),
            spec: spec.parse()?,
        })
    }

    /// Requirement satisfied by any installed version.
    pub fn any(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            spec: VersionSpec::any(),
        }
    }
}

/// Configured version specs, parsed once from a settings snapshot.
///
/// A stage's requirement is AND-combined with the configured spec, so it
/// can narrow a platform pin but cannot relax it: a platform pinned to
/// `==2.17.1.14` never yields another version, whatever the stage asks for.
#[derive(Debug, Clone, Default)]
pub struct VersionResolver {
    platform_specs: BTreeMap<String, BTreeMap<String, VersionSpec>>,
    default_specs: BTreeMap<String, VersionSpec>,
}

impl VersionResolver {
    /// Parses every `platform:*` value and every `<tool>.default_version`.
    pub fn from_config(config: &Configuration) -> Result<Self, ConfigError> {
        let mut resolver = Self::default();

        for (platform, keys) in config.platforms() {
            let section = format!("{}{}", PLATFORM_PREFIX, platform);
            let specs = keys
                .iter()
                .map(|(tool, text)| {
                    text.parse::<VersionSpec>()
                        .map(|spec| (tool.clone(), spec))
                        .map_err(|e| e.in_setting(&section, tool))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            resolver.platform_specs.insert(platform.to_string(), specs);
        }

        for (section, keys) in config.sections() {
            if RESERVED_SECTIONS.contains(&section) || section.starts_with(PLATFORM_PREFIX) {
                continue;
            }
            if let Some(text) = keys.get(DEFAULT_VERSION_KEY) {
                let spec = text
                    .parse::<VersionSpec>()
                    .map_err(|e| e.in_setting(section, DEFAULT_VERSION_KEY))?;
                resolver.default_specs.insert(section.to_string(), spec);
            }
        }

        Ok(resolver)
    }

    /// The configured spec for `tool` on `platform`, if any.
    pub fn configured_spec(&self, tool: &str, platform: Option<&str>) -> Option<&VersionSpec> {
        SPEC_LOOKUPS
            .iter()
            .find_map(|lookup| lookup(self, tool, platform))
    }

    fn platform_spec<'a>(&'a self, tool: &str, platform: Option<&str>) -> Option<&'a VersionSpec> {
        platform
            .and_then(|p| self.platform_specs.get(p))
            .and_then(|specs| specs.get(tool))
    }

    fn default_spec<'a>(&'a self, tool: &str, _platform: Option<&str>) -> Option<&'a VersionSpec> {
        self.default_specs.get(tool)
    }

    /// The spec actually applied: the requirement combined with the
    /// configured spec.
    pub fn effective_spec(&self, requirement: &ToolRequirement, platform: Option<&str>) -> VersionSpec {
        match self.configured_spec(&requirement.tool, platform) {
            Some(configured) => requirement.spec.and(configured),
            None => requirement.spec.clone(),
        }
    }

    /// Resolves a stage requirement against the inventory.
    pub fn resolve<'a>(
        &self,
        requirement: &ToolRequirement,
        platform: Option<&str>,
        inventory: &'a ToolInventory,
    ) -> Result<&'a InstalledTool, NoMatchingVersion> {
        let spec = self.effective_spec(requirement, platform);
        let chosen = resolve(&requirement.tool, &spec, inventory)?;

        debug!(
            "Resolved {} '{}' (platform: {}) to {}",
            requirement.tool,
            spec,
            platform.unwrap_or("none"),
            chosen.version
        );
        Ok(chosen)
    }
}
