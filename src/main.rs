//! AgentRunner CLI Entry Point
//!
//! Validates, previews and executes workflow documents with the builtin
//! agents.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow
//! agentrunner workflow.yaml
//!
//! # Dry run mode (show the schedule only)
//! agentrunner workflow.yaml --dry-run
//!
//! # Initial parameters
//! agentrunner workflow.yaml --param document="hello" --params params.json
//!
//! # Unattended review decisions
//! agentrunner workflow.yaml --auto-approve
//!
//! # Set maximum parallel steps
//! agentrunner workflow.yaml --parallel 8
//! ```

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use agentrunner::agent::{register_builtin_agents, AgentRegistry, DataMap};
use agentrunner::execution::{AutoApprove, AutoReject, ConsoleReviewer, Orchestrator};
use agentrunner::workflow::parser::load_workflow;
use agentrunner::workflow::state::{ExecutionStatus, WorkflowExecution};
use agentrunner::{APP_NAME, VERSION};

/// Default workflow file used when none is specified.
const DEFAULT_WORKFLOW: &str = "workflow.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Parser, Debug)]
#[command(name = "agentrunner", version, about = "Dependency-driven agent workflow engine")]
struct Cli {
    /// Path to the workflow document (YAML or JSON)
    #[arg(default_value = DEFAULT_WORKFLOW)]
    workflow: PathBuf,

    /// Validate and print the schedule without executing anything
    #[arg(long)]
    dry_run: bool,

    /// Maximum concurrent steps per parallel group (default: CPU count)
    #[arg(long, value_name = "N")]
    parallel: Option<usize>,

    /// Initial parameter, repeatable; values parse as JSON, else as strings
    #[arg(long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// JSON object file with initial parameters
    #[arg(long = "params", value_name = "FILE")]
    params_file: Option<PathBuf>,

    /// Default retry budget for steps with retry_on_failure
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Base delay between step retries in milliseconds
    #[arg(long, value_name = "MS")]
    retry_delay_ms: Option<u64>,

    /// Approve every human review automatically
    #[arg(long, conflicts_with = "auto_reject")]
    auto_approve: bool,

    /// Reject every human review automatically
    #[arg(long)]
    auto_reject: bool,

    /// Fail steps whose input references do not resolve
    #[arg(long)]
    strict_inputs: bool,

    /// Write the final execution record as JSON
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,

    /// Environment tag handed to agents
    #[arg(long, value_name = "NAME")]
    environment: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Agent Workflow Engine");
    println!();
}

/// Parses a `KEY=VALUE` parameter.
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid parameter '{}': expected KEY=VALUE", raw))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid parameter '{}': empty key", raw));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Builds the initial parameters from the params file, then `--param` flags.
fn collect_parameters(cli: &Cli) -> Result<DataMap, Box<dyn std::error::Error>> {
    let mut parameters = DataMap::new();

    if let Some(path) = &cli.params_file {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Could not read parameters from '{}': {}", path.display(), e))?;
        let value: Value = serde_json::from_str(&content)?;
        match value {
            Value::Object(map) => parameters.extend(map),
            _ => return Err(format!("Parameters file '{}' must hold a JSON object", path.display()).into()),
        }
    }

    for raw in &cli.params {
        let (key, value) = parse_param(raw)?;
        parameters.insert(key, value);
    }

    Ok(parameters)
}

fn build_engine(cli: &Cli) -> Orchestrator {
    let mut registry = AgentRegistry::new();
    register_builtin_agents(&mut registry);

    let mut engine = Orchestrator::new(Arc::new(registry));

    if let Some(parallel) = cli.parallel {
        engine.set_max_parallel(parallel);
    }
    if let Some(retries) = cli.retries {
        engine.set_max_step_retries(retries);
    }
    if let Some(delay_ms) = cli.retry_delay_ms {
        let max = engine.config().retry_max_delay;
        engine.set_retry_delays(Duration::from_millis(delay_ms), max);
    }
    if let Some(environment) = &cli.environment {
        engine.set_environment(environment.clone());
    }
    engine.set_strict_input_mapping(cli.strict_inputs);

    if cli.auto_approve {
        engine.set_reviewer(Arc::new(AutoApprove));
    } else if cli.auto_reject {
        engine.set_reviewer(Arc::new(AutoReject));
    } else {
        engine.set_reviewer(Arc::new(ConsoleReviewer::new()));
    }

    engine
}

/// Prints the final status line, per-step results and the timeline.
fn print_summary(execution: &WorkflowExecution) {
    let status = match execution.status {
        ExecutionStatus::Completed => execution.status.to_string().green().bold(),
        ExecutionStatus::Paused => execution.status.to_string().yellow().bold(),
        _ => execution.status.to_string().red().bold(),
    };

    println!();
    println!("Execution {}: {}", execution.execution_id, status);

    for step_id in &execution.execution_order {
        let Some(outcome) = execution.step_result(step_id) else {
            continue;
        };
        match outcome.error_message() {
            None => println!(
                "  {} {} ({} ms)",
                "✓".green(),
                step_id,
                outcome.duration_ms
            ),
            Some(message) => println!("  {} {}: {}", "✗".red(), step_id, message),
        }
    }

    if let Some(failure) = &execution.failure {
        println!("{} {}", "Reason:".red(), failure);
    }

    print!("{}", execution.timeline.gantt_chart());
    println!();
}

/// Main application entry point.
async fn run() -> Result<ExecutionStatus, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    // Print banner
    print_banner();

    // Load workflow
    info!("Loading workflow: {}", cli.workflow.display());
    let workflow = load_workflow(&cli.workflow).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        format!("Could not load workflow from '{}': {}", cli.workflow.display(), e)
    })?;

    info!(
        "Workflow loaded: '{}' with {} steps, {} agent types",
        workflow.name,
        workflow.len(),
        workflow.agent_types().len()
    );

    let engine = build_engine(&cli);

    if cli.dry_run {
        info!("Mode: DRY RUN (steps will not execute)");
        println!();
        for (index, batch) in engine.plan(&workflow)?.iter().enumerate() {
            println!("Iteration {}:", index + 1);
            for group in &batch.parallel_groups {
                let ids: Vec<&str> = group.iter().map(|s| s.step_id.as_str()).collect();
                println!("  parallel: {}", ids.join(", "));
            }
            for step in &batch.sequential {
                println!("  step:     {} ({})", step.step_id, step.agent_type);
            }
        }
        return Ok(ExecutionStatus::Completed);
    }

    let parameters = collect_parameters(&cli)?;
    let execution = engine.run(workflow, parameters).await?;

    print_summary(&execution);

    if let Some(path) = &cli.report {
        fs::write(path, serde_json::to_string_pretty(&execution)?)?;
        info!("Execution report written to {}", path.display());
    }

    if execution.status == ExecutionStatus::Paused {
        warn!("Execution paused for review; rerun with --auto-approve to continue unattended");
    }

    Ok(execution.status)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(ExecutionStatus::Completed) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
