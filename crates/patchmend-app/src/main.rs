//! patchmend - repairs vendored patches that stopped applying upstream
//!
//! Reproduces each failing patch on a clean checkout, asks a repair oracle
//! for a rebased version, and keeps it only once it applies and builds.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use patchmend_adapters::Config;
use patchmend_engine::{
    check, fix, FixRequest, OracleClient, PatchCheck, PatchOutcome, PatchStatus,
};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PATCHMEND_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "patchmend",
    about = "Repair patches in a patch series that no longer apply",
    version
)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Repair every failing patch of a project, in series order
    Fix(FixArgs),
    /// Dry run: report which patches apply, without contacting the oracle
    Check(CheckArgs),
    /// Show or locate the configuration file
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct FixArgs {
    #[arg(long)]
    project: String,
    /// Change request the fix belongs to
    #[arg(long = "change")]
    change_request: String,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Only this patch (file name or series number)
    #[arg(long)]
    patch: Option<String>,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(long)]
    project: String,
    #[arg(long = "change", default_value = "")]
    change_request: String,
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Print the effective configuration
    #[arg(long)]
    show: bool,
    /// Print where the configuration file lives
    #[arg(long)]
    path: bool,
    /// Write a default configuration file if none exists
    #[arg(long)]
    init: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Commands::Fix(args) => run_fix(args).await,
        Commands::Check(args) => run_check(args),
        Commands::Config(args) => run_config(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("  ! {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,patchmend={level},patchmend_core={level},patchmend_adapters={level},patchmend_engine={level}"
        ))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_fix(args: FixArgs) -> Result<ExitCode> {
    let config = Config::load();
    config.validate()?;
    tracing::debug!(
        project = %args.project,
        model = %config.oracle.model,
        config = %Config::config_location(),
        "configuration loaded"
    );

    // Checked before anything touches the checkout.
    let api_key = Config::api_key().ok_or_else(|| {
        anyhow!("No API key found. Set PATCHMEND_API_KEY (or OPENROUTER_API_KEY / OPENAI_API_KEY).")
    })?;
    let oracle = OracleClient::new(config.oracle.clone(), api_key)?;

    let request = FixRequest {
        project: args.project,
        change_request: args.change_request,
        max_attempts: args.max_attempts,
        only_patch: args.patch,
    };
    let run = fix(&config, &request, &oracle).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run.report)?);
    } else {
        for outcome in &run.report.patches {
            print_outcome(outcome);
        }
        println!();
        println!(
            "  {} patch(es), {} oracle call(s). Report: {}",
            run.report.patches.len(),
            run.report.oracle_calls(),
            run.report_path.display()
        );
    }

    Ok(if run.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_outcome(outcome: &PatchOutcome) {
    let attempts = outcome.attempts.len();
    match &outcome.status {
        PatchStatus::AlreadyClean => println!("  + {}  applies cleanly", outcome.name),
        PatchStatus::Repaired { .. } => println!(
            "  + {}  repaired after {} attempt(s)",
            outcome.name, attempts
        ),
        PatchStatus::Exhausted {
            last_diagnostic,
            failing_files,
        } => {
            println!(
                "  ! {}  gave up after {} attempt(s); still failing: {}",
                outcome.name,
                attempts,
                failing_files.join(", ")
            );
            for line in last_diagnostic.lines().take(20) {
                println!("      {}", line);
            }
        }
        PatchStatus::Invalid { message } => {
            println!("  ! {}  is not a valid patch: {}", outcome.name, message)
        }
    }
}

fn run_check(args: CheckArgs) -> Result<ExitCode> {
    let config = Config::load();
    let checks = check(&config, &args.project, &args.change_request)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&checks)?);
    } else {
        for patch in &checks {
            print_check(patch);
        }
    }

    Ok(if checks.iter().all(PatchCheck::is_clean) {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_check(patch: &PatchCheck) {
    let mark = if patch.is_clean() { '+' } else { '!' };
    println!("  {} {}", mark, patch.name);
    if let Some(error) = &patch.error {
        println!("      {}", error);
    }
    for file in &patch.files {
        match &file.note {
            Some(note) => println!(
                "      {} [{}] {} ({})",
                file.path, file.kind, file.outcome, note
            ),
            None => println!("      {} [{}] {}", file.path, file.kind, file.outcome),
        }
    }
}

fn run_config(args: ConfigArgs) -> Result<ExitCode> {
    if args.path {
        println!("{}", Config::config_location());
    }
    if args.init {
        match Config::config_path() {
            Some(path) if path.exists() => {
                println!("  Config already exists at {}", path.display())
            }
            _ => {
                let path = Config::default()
                    .save()
                    .context("Failed to write default config")?;
                println!("  + Wrote default config to {}", path.display());
            }
        }
    }
    if args.show || !(args.path || args.init) {
        let config = Config::load();
        println!("{}", serde_json::to_string_pretty(&config)?);
        let key = if Config::api_key().is_some() { "set" } else { "missing" };
        println!("  API key: {}", key);
    }
    Ok(ExitCode::SUCCESS)
}
