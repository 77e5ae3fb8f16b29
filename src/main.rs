//! stagerun CLI Entry Point
//!
//! Dispatches one pipeline stage from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Run a command as stage "qc" using the configured runner
//! stagerun --settings settings.yaml --stage qc -- fastqc sample.fastq.gz
//!
//! # Pick bcl2fastq for a NextSeq run and show what would happen
//! stagerun --settings settings.yaml --inventory-dir /opt/apps \
//!     --instrument NB500968 --stage make_fastqs --tool bcl2fastq --dry-run -- bcl2fastq
//!
//! # Force the local runner and print the result as JSON
//! stagerun --stage qc --runner 'SimpleJobRunner(nslots=4)' --json -- ./run_qc.sh
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};

use stagerun::dispatch::{DispatchResult, PreparedJob};
use stagerun::{
    Configuration, DispatchOptions, Dispatcher, JobCommand, JobStatus, RunContext, RunnerSpec,
    ToolInventory, ToolRequirement, APP_NAME, VERSION,
};

/// Where the tool inventory comes from.
#[derive(Debug, Clone, PartialEq)]
enum InventorySource {
    None,
    File(PathBuf),
    Directory(PathBuf),
}

/// Command-line configuration parsed from arguments.
#[derive(Debug, PartialEq)]
struct Config {
    settings_path: Option<PathBuf>,
    inventory: InventorySource,
    platform: Option<String>,
    instrument: Option<String>,
    stage: Option<String>,
    runner: Option<String>,
    tool: Option<String>,
    tool_version: Option<String>,
    working_dir: Option<PathBuf>,
    command: Vec<String>,
    dry_run: bool,
    json: bool,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_path: None,
            inventory: InventorySource::None,
            platform: None,
            instrument: None,
            stage: None,
            runner: None,
            tool: None,
            tool_version: None,
            working_dir: None,
            command: Vec::new(),
            dry_run: false,
            json: false,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stagerun [OPTIONS] --stage NAME [--] <COMMAND> [ARGS...]");
    println!();
    println!("Options:");
    println!("  --settings FILE        Settings snapshot (YAML)");
    println!("  --inventory FILE       Installed tool versions (JSON)");
    println!("  --inventory-dir DIR    Scan installed tools laid out as DIR/<tool>/<version>");
    println!("  --platform NAME        Sequencing platform of the run");
    println!("  --instrument NAME      Derive the platform from the 'sequencers' section");
    println!("  --stage NAME           Stage name used for runner selection");
    println!("  --runner EXPR          Runner override, e.g. 'GEJobRunner(-pe smp.pe 8)'");
    println!("  --tool NAME            Tool the command needs");
    println!("  --tool-version SPEC    Version requirement for --tool, e.g. '>=2.17,<2.20'");
    println!("  --working-dir PATH     Directory to run the command in");
    println!("  --dry-run              Show runner and tool version without executing");
    println!("  --json                 Print the result as JSON");
    println!("  --verbose              Enable debug logging");
    println!("  --help                 Show this help message");
    println!("  --version              Show version information");
    println!();
    println!("Examples:");
    println!("  stagerun --settings settings.yaml --stage qc -- fastqc sample.fastq.gz");
    println!("  stagerun --stage make_fastqs --tool bcl2fastq --tool-version '>=2.20' --dry-run -- bcl2fastq");
}

/// Takes the value following an option.
fn option_value(args: &[String], i: &mut usize, option: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--json" => config.json = true,
            "--verbose" | "-v" => config.verbose = true,
            "--settings" => {
                config.settings_path = Some(option_value(args, &mut i, arg)?.into());
            }
            "--inventory" => {
                config.inventory = InventorySource::File(option_value(args, &mut i, arg)?.into());
            }
            "--inventory-dir" => {
                config.inventory =
                    InventorySource::Directory(option_value(args, &mut i, arg)?.into());
            }
            "--platform" => config.platform = Some(option_value(args, &mut i, arg)?),
            "--instrument" => config.instrument = Some(option_value(args, &mut i, arg)?),
            "--stage" => config.stage = Some(option_value(args, &mut i, arg)?),
            "--runner" => config.runner = Some(option_value(args, &mut i, arg)?),
            "--tool" => config.tool = Some(option_value(args, &mut i, arg)?),
            "--tool-version" => config.tool_version = Some(option_value(args, &mut i, arg)?),
            "--working-dir" => {
                config.working_dir = Some(option_value(args, &mut i, arg)?.into());
            }
            "--" => {
                config.command = args[i + 1..].to_vec();
                break;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                // The command starts at the first positional argument
                config.command = args[i..].to_vec();
                break;
            }
        }
        i += 1;
    }

    if config.stage.is_none() {
        return Err("--stage is required".to_string());
    }
    if config.command.is_empty() {
        return Err("no command given".to_string());
    }
    if config.tool_version.is_some() && config.tool.is_none() {
        return Err("--tool-version requires --tool".to_string());
    }
    if config.platform.is_some() && config.instrument.is_some() {
        return Err("--platform and --instrument are mutually exclusive".to_string());
    }

    Ok(config)
}

fn load_inventory(source: &InventorySource) -> Result<ToolInventory, Box<dyn std::error::Error>> {
    let inventory = match source {
        InventorySource::None => ToolInventory::new(),
        InventorySource::File(path) => {
            info!("Loading tool inventory from: {}", path.display());
            ToolInventory::load(path)?
        }
        InventorySource::Directory(dir) => {
            info!("Scanning tool inventory under: {}", dir.display());
            ToolInventory::scan(dir)?
        }
    };
    info!("Tool inventory: {} installed versions", inventory.len());
    Ok(inventory)
}

fn run_context(config: &Config, settings: &Configuration) -> RunContext {
    match (&config.platform, &config.instrument) {
        (Some(platform), _) => RunContext::with_platform(platform.clone()),
        (None, Some(instrument)) => {
            let context = RunContext::for_instrument(settings, instrument);
            if context.platform.is_none() {
                info!("Instrument '{}' has no platform in 'sequencers'", instrument);
            }
            context
        }
        (None, None) => RunContext::new(),
    }
}

fn dispatch_options(config: &Config) -> Result<DispatchOptions, Box<dyn std::error::Error>> {
    let mut options = DispatchOptions::new();

    if let Some(runner) = &config.runner {
        options = options.with_runner(runner.parse::<RunnerSpec>()?);
    }
    if let Some(tool) = &config.tool {
        let requirement = match &config.tool_version {
            Some(spec) => ToolRequirement::new(tool.clone(), spec)?,
            None => ToolRequirement::any(tool.clone()),
        };
        options = options.with_tool(requirement);
    }
    if let Some(dir) = &config.working_dir {
        if !dir.is_dir() {
            return Err(format!("Working directory does not exist: {}", dir.display()).into());
        }
        options = options.in_directory(dir.clone());
    }

    Ok(options)
}

fn print_plan(prepared: &PreparedJob, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let job = &prepared.job;

    if json {
        let plan = serde_json::json!({
            "stage": job.stage,
            "runner": job.runner,
            "tool": prepared.tool,
            "working_dir": job.working_dir,
            "env": job.env,
            "command": job.command.to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!();
    println!("[DRY RUN] Stage: {}", job.stage.bold());
    println!("  Runner: {}", job.runner);
    if let Some(tool) = &prepared.tool {
        println!("  Tool: {} {}", tool.name, tool.version);
        if let Some(location) = &tool.location {
            println!("  Location: {}", location.display());
        }
    }
    println!("  Working dir: {}", job.working_dir.display());
    for (name, value) in &job.env {
        if name != "PATH" {
            println!("  {}={}", name, value);
        }
    }
    println!("  Command: {}", job.command);
    Ok(())
}

fn print_result(result: &DispatchResult) {
    let status = match result.status {
        JobStatus::Success => result.status.to_string().green().bold(),
        JobStatus::Cancelled => result.status.to_string().yellow().bold(),
        _ => result.status.to_string().red().bold(),
    };

    println!();
    println!("Stage '{}': {}", result.stage, status);
    if let Some(runner) = &result.runner {
        println!("  Runner: {}", runner);
    }
    if let Some(tool) = &result.tool {
        println!("  Tool: {} {}", tool.name, tool.version);
    }
    if let Some(job_id) = &result.job_id {
        println!("  Job: {}", job_id);
    }
    if let Some(stdout) = &result.stdout {
        println!("  Stdout: {}", stdout.display());
    }
    if let Some(stderr) = &result.stderr {
        println!("  Stderr: {}", stderr.display());
    }
    println!("  Started: {}", result.started_at.to_rfc3339());
    println!("  Elapsed: {:.2?}", result.elapsed);
    if !result.is_success() {
        println!("  {}", result.message);
    }
}

/// Exit status for the process: the job's own code when it has one.
fn exit_status(result: &DispatchResult) -> u8 {
    match result.status {
        JobStatus::Success => 0,
        JobStatus::Failed(Some(code)) => u8::try_from(code).ok().filter(|&c| c != 0).unwrap_or(1),
        _ => 1,
    }
}

/// Main application entry point.
fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);

    let settings = match &config.settings_path {
        Some(path) => {
            info!("Loading settings from: {}", path.display());
            Configuration::load(path)?
        }
        None => Configuration::new(),
    };
    let inventory = load_inventory(&config.inventory)?;
    let context = run_context(&config, &settings);
    let options = dispatch_options(&config)?;

    let dispatcher = Dispatcher::new(Arc::new(settings), Arc::new(inventory), context)
        .map_err(|e| {
            error!("Invalid settings: {}", e);
            e
        })?;

    let stage = config.stage.as_deref().unwrap_or_default();
    let command = JobCommand::new(&config.command[0]).args(&config.command[1..]);

    if config.dry_run {
        info!("Mode: DRY RUN (command will not execute)");
        let prepared = dispatcher.prepare(stage, command, &options)?;
        print_plan(&prepared, config.json)?;
        return Ok(ExitCode::SUCCESS);
    }

    info!("Dispatching stage '{}'", stage);
    let result = dispatcher.dispatch(stage, command, options);
    if result.is_success() {
        info!("{}", result.message);
    } else {
        error!("{}", result.message);
    }

    if config.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    Ok(ExitCode::from(exit_status(&result)))
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
