//! Stage Dispatcher
//!
//! The entry point pipeline stages call to run a command. For each call
//! the dispatcher:
//!
//! 1. resolves the runner (call-time override, then configuration)
//! 2. resolves the tool version the stage needs, if any, and exports
//!    `<TOOL>_VERSION` and the tool's `bin` directory on `PATH`
//! 3. hands the job to the backend registered for the runner's kind
//! 4. waits and reports a [`DispatchResult`]
//!
//! A dispatcher holds only immutable state, so one instance can serve
//! any number of concurrent stages.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, trace};

use super::result::{Attempt, DispatchResult};
use crate::config::{ConfigError, Configuration, DispatchSettings};
use crate::error::DispatchError;
use crate::runners::{
    BackendKind, ClusterRunner, Job, JobCommand, JobHandle, JobOutcome, JobRunner, LocalRunner,
    RunnerRegistry, RunnerSpec,
};
use crate::versions::{InstalledTool, ToolInventory, ToolRequirement, VersionResolver};

/// Facts about the current run that affect resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    /// Sequencing platform, selecting a `platform:<name>` section
    pub platform: Option<String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_platform(platform: impl Into<String>) -> Self {
        Self {
            platform: Some(platform.into()),
        }
    }

    /// Looks the platform up in the `sequencers` section.
    pub fn for_instrument(config: &Configuration, instrument: &str) -> Self {
        Self {
            platform: config.platform_for_instrument(instrument).map(str::to_string),
        }
    }
}

/// Per-call choices of a stage.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// Runner that wins over configuration
    pub runner_override: Option<RunnerSpec>,
    /// Tool the command needs
    pub tool_version_requirement: Option<ToolRequirement>,
    /// Directory to run in; the current directory if unset
    pub working_directory: Option<PathBuf>,
}

impl DispatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, runner: RunnerSpec) -> Self {
        self.runner_override = Some(runner);
        self
    }

    pub fn with_tool(mut self, requirement: ToolRequirement) -> Self {
        self.tool_version_requirement = Some(requirement);
        self
    }

    pub fn in_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// A job ready to submit, with the tool version chosen for it.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub job: Job,
    pub tool: Option<InstalledTool>,
}

/// Routes stages to job runners.
pub struct Dispatcher {
    config: Arc<Configuration>,
    inventory: Arc<ToolInventory>,
    context: RunContext,
    registry: RunnerRegistry,
    versions: VersionResolver,
    settings: DispatchSettings,
    runners: HashMap<BackendKind, Arc<dyn JobRunner>>,
}

impl Dispatcher {
    /// Builds a dispatcher with the local and Grid Engine backends.
    ///
    /// Every runner expression and version spec in `config` is parsed
    /// here, so malformed settings fail before any stage runs.
    pub fn new(
        config: Arc<Configuration>,
        inventory: Arc<ToolInventory>,
        context: RunContext,
    ) -> Result<Self, ConfigError> {
        let registry = RunnerRegistry::new(&config)?;
        let versions = VersionResolver::from_config(&config)?;
        let settings = DispatchSettings::from_config(&config)?;

        let mut runners: HashMap<BackendKind, Arc<dyn JobRunner>> = HashMap::new();
        runners.insert(
            BackendKind::Local,
            Arc::new(LocalRunner::new(settings.log_dir.clone())),
        );
        runners.insert(
            BackendKind::Cluster,
            Arc::new(ClusterRunner::grid_engine(&settings)),
        );

        debug!(
            "Dispatcher ready: platform {}, {} tools in inventory, logs in {}",
            context.platform.as_deref().unwrap_or("unset"),
            inventory.len(),
            settings.log_dir.display()
        );

        Ok(Self {
            config,
            inventory,
            context,
            registry,
            versions,
            settings,
            runners,
        })
    }

    /// Replaces the backend used for `kind`.
    pub fn with_runner(mut self, kind: BackendKind, runner: Arc<dyn JobRunner>) -> Self {
        self.runners.insert(kind, runner);
        self
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn inventory(&self) -> &ToolInventory {
        &self.inventory
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Resolves runner and tool version and builds the job, without
    /// submitting it.
    pub fn prepare(
        &self,
        stage: &str,
        command: JobCommand,
        options: &DispatchOptions,
    ) -> Result<PreparedJob, DispatchError> {
        let runner = self
            .registry
            .resolve_with_override(stage, options.runner_override.as_ref());

        let tool = options
            .tool_version_requirement
            .as_ref()
            .map(|requirement| {
                self.versions
                    .resolve(requirement, self.context.platform.as_deref(), &self.inventory)
                    .cloned()
                    .map_err(|source| DispatchError::NoMatchingVersion {
                        stage: stage.to_string(),
                        source,
                    })
            })
            .transpose()?;

        let env = match &tool {
            Some(tool) => tool_environment(stage, tool)?,
            None => BTreeMap::new(),
        };

        let working_dir = match &options.working_directory {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|e| {
                DispatchError::submission(stage, format!("no working directory: {}", e))
            })?,
        };

        Ok(PreparedJob {
            job: Job {
                stage: stage.to_string(),
                command,
                working_dir,
                runner,
                env,
            },
            tool,
        })
    }

    /// Submits a stage and returns without waiting.
    ///
    /// A stage that could not be started comes back as the `Err` result.
    pub fn start(
        &self,
        stage: &str,
        command: JobCommand,
        options: DispatchOptions,
    ) -> Result<RunningStage, DispatchResult> {
        let mut attempt = Attempt::begin(stage);

        let prepared = match self.prepare(stage, command, &options) {
            Ok(prepared) => prepared,
            Err(e) => return Err(fail(attempt, e)),
        };
        attempt.runner = Some(prepared.job.runner.clone());
        attempt.tool = prepared.tool;

        let kind = prepared.job.runner.kind();
        let Some(runner) = self.runners.get(&kind).cloned() else {
            let e = DispatchError::submission(stage, format!("no runner registered for '{}'", kind));
            return Err(fail(attempt, e));
        };

        debug!("Starting stage '{}' with {}", stage, prepared.job.runner);
        match runner.submit(prepared.job) {
            Ok(handle) => Ok(RunningStage {
                runner,
                handle,
                attempt,
            }),
            Err(e) => Err(fail(attempt, e)),
        }
    }

    /// Runs a stage to completion.
    pub fn dispatch(
        &self,
        stage: &str,
        command: JobCommand,
        options: DispatchOptions,
    ) -> DispatchResult {
        match self.start(stage, command, options) {
            Ok(running) => running.wait(),
            Err(result) => result,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut backends: Vec<_> = self.runners.keys().collect();
        backends.sort();
        f.debug_struct("Dispatcher")
            .field("context", &self.context)
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .field("backends", &backends)
            .finish()
    }
}

fn fail(attempt: Attempt, e: DispatchError) -> DispatchResult {
    debug!("Stage '{}' not started: {}", attempt.stage, e);
    attempt.finish(None, Err(e))
}

/// `<TOOL>_VERSION` plus `PATH` with the tool's location in front.
fn tool_environment(
    stage: &str,
    tool: &InstalledTool,
) -> Result<BTreeMap<String, String>, DispatchError> {
    let mut env = BTreeMap::new();
    env.insert(tool.version_variable(), tool.version.to_string());

    if let Some(location) = &tool.location {
        let mut paths = vec![location.clone()];
        if let Some(existing) = std::env::var_os("PATH") {
            paths.extend(std::env::split_paths(&existing));
        }
        let joined = std::env::join_paths(paths).map_err(|e| {
            DispatchError::submission(
                stage,
                format!("cannot put {} on PATH: {}", location.display(), e),
            )
        })?;
        env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
    }

    Ok(env)
}

/// A submitted stage.
pub struct RunningStage {
    runner: Arc<dyn JobRunner>,
    handle: JobHandle,
    attempt: Attempt,
}

impl RunningStage {
    pub fn stage(&self) -> &str {
        self.handle.stage()
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// A cancel switch that can be moved to another thread.
    pub fn canceller(&self) -> StageCanceller {
        StageCanceller {
            runner: Arc::clone(&self.runner),
            handle: self.handle.clone(),
        }
    }

    /// Blocks until the stage finishes or is cancelled.
    pub fn wait(self) -> DispatchResult {
        let outcome = self.runner.wait(&self.handle);
        let logs = self.handle.logs();
        let job = Some((
            self.handle.id().to_string(),
            logs.stdout.clone(),
            logs.stderr.clone(),
        ));

        trace!("Stage '{}' finished: {:?}", self.stage(), outcome);
        self.attempt.finish(job, outcome)
    }
}

impl std::fmt::Debug for RunningStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningStage")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Cancels a running stage from any thread.
#[derive(Clone)]
pub struct StageCanceller {
    runner: Arc<dyn JobRunner>,
    handle: JobHandle,
}

impl StageCanceller {
    pub fn cancel(&self) {
        debug!("Cancelling stage '{}' (job {})", self.handle.stage(), self.handle.id());
        self.runner.cancel(&self.handle);
    }
}
