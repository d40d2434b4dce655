//! batchcore CLI Entry Point
//!
//! Runs a batch plan against a profile.
//!
//! # Usage
//!
//! ```bash
//! # Run a batch
//! batchcore batch.yaml --profile profile.yaml
//!
//! # Preview the command lines of every job
//! batchcore batch.yaml --profile profile.yaml --dry-run
//!
//! # Fixed execution id and a JSON report
//! batchcore batch.yaml --execution-id 20240101-1 --report run.json
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};

use batchcore::config::{ParallelConfig, Profile, SshConfig};
use batchcore::execution::{ProcessCommandExecutor, SshCommandExecutor};
use batchcore::liveness::LivenessKeeper;
use batchcore::scheduler::JobScheduler;
use batchcore::workflow::{load_plan, ExecutorSet, FlowRunner, RunStatus, RunSummary};
use batchcore::{APP_NAME, VERSION};

/// Default profile used when none is specified.
const DEFAULT_PROFILE: &str = "profile.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    plan_path: Option<String>,
    profile_path: Option<String>,
    execution_id: Option<String>,
    report_path: Option<PathBuf>,
    dry_run: bool,
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

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Phase-scoped batch execution");
    println!();
}

fn print_usage() {
    println!("Usage: batchcore [OPTIONS] <PLAN_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PLAN_FILE>          Path to batch plan YAML file");
    println!();
    println!("Options:");
    println!("  --profile PATH       Profile with parallel.* and ssh.* keys (default: {})", DEFAULT_PROFILE);
    println!("  --execution-id ID    Execution id (default: current UTC time)");
    println!("  --report PATH        Write a JSON run summary");
    println!("  --dry-run            Print command lines without running them");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  batchcore batch.yaml");
    println!("  batchcore batch.yaml --profile prod.yaml --dry-run");
    println!("  batchcore batch.yaml --execution-id nightly-42 --report run.json");
}

/// Returns the value following an option.
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
            "--verbose" | "-v" => config.verbose = true,
            "--profile" => config.profile_path = Some(option_value(args, &mut i, arg)?),
            "--execution-id" => config.execution_id = Some(option_value(args, &mut i, arg)?),
            "--report" => config.report_path = Some(PathBuf::from(option_value(args, &mut i, arg)?)),
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.plan_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.plan_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    if config.plan_path.is_none() {
        return Err("missing <PLAN_FILE>".to_string());
    }
    Ok(config)
}

fn status_label(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Succeeded => "OK".green(),
        RunStatus::Failed => "FAILED".red().bold(),
        RunStatus::Skipped => "SKIPPED".yellow(),
        RunStatus::Planned => "PLANNED".cyan(),
    }
}

/// Prints one line per phase, plus dry-run commands and Gantt charts.
fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "Batch {} (execution {})",
        summary.batch_id.bold(),
        summary.execution_id
    );

    for flow in &summary.flows {
        println!();
        println!("Flow {} [{}]", flow.flow_id.bold(), status_label(flow.status));

        for phase in &flow.phases {
            println!(
                "  {:<11} {:>3} job(s) {:>8} ms  {}",
                phase.phase.to_string(),
                phase.jobs,
                phase.elapsed_ms,
                status_label(phase.status)
            );
            if phase.fallbacks > 0 {
                println!("              {} job(s) ran on the default pool", phase.fallbacks);
            }
            if let Some(message) = &phase.error {
                println!("              {}", message.red());
            }
            for command in &phase.commands {
                println!("              {}", command);
            }
            if let Some(timeline) = &phase.timeline {
                if !timeline.spans().is_empty() {
                    print!("{}", timeline.gantt_chart());
                }
            }
        }
    }

    let elapsed = summary.finished_at - summary.started_at;
    println!();
    println!(
        "Result: {} in {:.2}s",
        status_label(summary.status),
        elapsed.num_milliseconds() as f64 / 1000.0
    );
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    if config.dry_run {
        info!("Mode: DRY RUN (commands will not execute)");
    }

    let profile_path = config.profile_path.as_deref().unwrap_or(DEFAULT_PROFILE);
    let profile = Profile::load(profile_path)?;
    let parallel = ParallelConfig::from_profile(&profile)?;

    let plan_path = config.plan_path.as_deref().unwrap_or_default();
    let plan = load_plan(plan_path).map_err(|e| {
        error!("Failed to load plan: {}", e);
        e
    })?;

    let mut scheduler = JobScheduler::new();
    scheduler.configure(&parallel)?;

    let mut executors = ExecutorSet::new(Arc::new(ProcessCommandExecutor::new()));
    let mut keeper: Option<Arc<LivenessKeeper>> = None;
    if plan.needs_remote() {
        let ssh = SshConfig::from_profile(&profile)?;
        info!(
            "Remote jobs run as {}@{}:{}",
            ssh.credential.user,
            ssh.credential.host,
            ssh.credential.effective_port()
        );

        let keep_alive = ssh.settings.keep_alive_interval;
        let mut remote = SshCommandExecutor::from_config(ssh);
        if !keep_alive.is_zero() {
            let started = Arc::new(LivenessKeeper::start(keep_alive)?);
            remote = remote.with_liveness(Arc::clone(&started));
            keeper = Some(started);
        }
        executors = executors.with_remote(Arc::new(remote));
    }

    let mut runner = FlowRunner::new(scheduler, executors);
    if let Some(id) = config.execution_id {
        runner = runner.with_execution_id(id);
    }
    runner.set_dry_run(config.dry_run);

    let summary = runner.run(&plan)?;
    if let Some(keeper) = keeper {
        keeper.close();
    }

    print_summary(&summary);

    if let Some(path) = &config.report_path {
        fs::write(path, summary.to_json()?)
            .map_err(|e| format!("Could not write report to '{}': {}", path.display(), e))?;
        info!("Report written to {}", path.display());
    }

    if let Some(message) = summary.first_error() {
        error!("{}", message);
    }
    Ok(summary.succeeded())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("batchcore")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_plan_and_options() {
        let config = parse_arguments(&args(&[
            "batch.yaml",
            "--profile",
            "p.yaml",
            "--execution-id",
            "e1",
            "--report",
            "out.json",
            "--dry-run",
        ]))
        .unwrap();

        assert_eq!(config.plan_path.as_deref(), Some("batch.yaml"));
        assert_eq!(config.profile_path.as_deref(), Some("p.yaml"));
        assert_eq!(config.execution_id.as_deref(), Some("e1"));
        assert_eq!(config.report_path, Some(PathBuf::from("out.json")));
        assert!(config.dry_run);
        assert!(!config.verbose);
    }

    #[test]
    fn test_missing_plan_is_error() {
        assert!(parse_arguments(&args(&["--dry-run"])).is_err());
    }

    #[test]
    fn test_option_without_value_is_error() {
        let err = parse_arguments(&args(&["batch.yaml", "--profile"])).unwrap_err();
        assert!(err.contains("--profile"));
    }

    #[test]
    fn test_unknown_option_and_extra_argument() {
        assert!(parse_arguments(&args(&["batch.yaml", "--fast"])).is_err());
        assert!(parse_arguments(&args(&["a.yaml", "b.yaml"])).is_err());
    }
}
