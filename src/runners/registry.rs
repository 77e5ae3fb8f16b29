//! Runner Registry
//!
//! Decides which backend runs a stage. Most specific wins:
//!
//! 1. an override passed by the stage at call time
//! 2. `runners.<stage>`
//! 3. `general.default_runner`
//! 4. `SimpleJobRunner` with no arguments
//!
//! All runner expressions in the settings are parsed when the registry
//! is built, so a typo fails the whole run up front instead of when the
//! affected stage is reached.

use std::collections::BTreeMap;

use log::debug;

use super::spec::RunnerSpec;
use crate::config::{ConfigError, Configuration};

type RunnerLookup = for<'a> fn(&'a RunnerRegistry, &str) -> Option<&'a RunnerSpec>;

/// Configured runner sources, most specific first.
const RUNNER_LOOKUPS: [RunnerLookup; 2] = [RunnerRegistry::stage_runner, RunnerRegistry::default_runner];

/// Parsed runner configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerRegistry {
    default: Option<RunnerSpec>,
    stages: BTreeMap<String, RunnerSpec>,
}

impl RunnerRegistry {
    /// Parses `general.default_runner` and every `runners.*` entry.
    pub fn new(config: &Configuration) -> Result<Self, ConfigError> {
        let default = config
            .get("general", "default_runner")
            .map(|text| {
                text.parse::<RunnerSpec>()
                    .map_err(|e| e.in_setting("general", "default_runner"))
            })
            .transpose()?;

        let mut stages = BTreeMap::new();
        if let Some(section) = config.section("runners") {
            for (stage, text) in section {
                if text.trim().is_empty() {
                    continue;
                }
                let spec = text
                    .parse::<RunnerSpec>()
                    .map_err(|e| e.in_setting("runners", stage))?;
                stages.insert(stage.clone(), spec);
            }
        }

        debug!(
            "Runner registry: default {}, {} stage overrides",
            default
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unset".to_string()),
            stages.len()
        );

        Ok(Self { default, stages })
    }

    /// Resolves the runner for a stage from configuration alone.
    pub fn resolve(&self, stage: &str) -> RunnerSpec {
        self.resolve_with_override(stage, None)
    }

    /// Resolves the runner for a stage, letting `explicit` win.
    pub fn resolve_with_override(&self, stage: &str, explicit: Option<&RunnerSpec>) -> RunnerSpec {
        explicit
            .or_else(|| RUNNER_LOOKUPS.iter().find_map(|lookup| lookup(self, stage)))
            .cloned()
            .unwrap_or_else(RunnerSpec::local)
    }

    /// Stages with their own `runners` entry.
    pub fn stage_overrides(&self) -> impl Iterator<Item = (&str, &RunnerSpec)> {
        self.stages.iter().map(|(stage, spec)| (stage.as_str(), spec))
    }

    fn stage_runner<'a>(&'a self, stage: &str) -> Option<&'a RunnerSpec> {
        self.stages.get(stage)
    }

    fn default_runner<'a>(&'a self, _stage: &str) -> Option<&'a RunnerSpec> {
        self.default.as_ref()
    }
}
