//! # buildscope - Main Entry Point
//!
//! Runs one scenario described by flags, or every scenario of a
//! `--scenario-file`, then writes `summary.json` to the output directory.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use buildscope::cli::Args;
use buildscope::domain::RunError;
use buildscope::export::{write_summary, RunSummary, ScenarioSummary};
use buildscope::preflight::prepare_output_dir;
use buildscope::runner::{
    CommandAdapter, RunSettings, Scenario, ScenarioOutcome, ScenarioRunner, TokioLauncher,
};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RunError>() {
        Some(RunError::Cancelled { .. }) => EXIT_INTERRUPTED,
        Some(RunError::Configuration(_)) => EXIT_CONFIG,
        _ if err.to_string().starts_with("Missing build command") => EXIT_USAGE,
        _ => EXIT_ERROR,
    }
}

fn load_scenarios(args: &Args) -> Result<Vec<Scenario>> {
    if let Some(path) = &args.scenario_file {
        return Scenario::load_file(path).map_err(|e| RunError::Configuration(e).into());
    }
    if args.command.is_empty() {
        anyhow::bail!(
            "Missing build command\n\n\
             Usage:\n  \
             buildscope [OPTIONS] -- <COMMAND>...\n  \
             buildscope --scenario-file <FILE>\n\n\
             Run 'buildscope --help' for more options"
        );
    }
    Ok(vec![args.scenario()])
}

fn print_scenario(summary: &ScenarioSummary) {
    println!(
        "\n{} ({} profiler): {}/{} builds attempted{}",
        summary.name,
        summary.backend,
        summary.attempted,
        summary.warmups + summary.iterations,
        if summary.aborted { ", aborted" } else { "" }
    );
    for stats in &summary.statistics {
        println!(
            "  {:<24} mean {:>9.1} {unit}  median {:>9.1} {unit}  min {:>9.1}  max {:>9.1}  stddev {:>7.1}  (n={})",
            stats.name,
            stats.mean,
            stats.median,
            stats.min,
            stats.max,
            stats.std_dev,
            stats.iterations,
            unit = stats.unit,
        );
    }
    for failure in &summary.failures {
        println!("  FAILED {}: {}", failure.display_name, failure.error);
    }
    if summary.missing_captures > 0 {
        println!("  profiler capture missing for {} build(s)", summary.missing_captures);
    }
    if let Some(log) = &summary.event_log {
        println!("  event log: {}", log.display());
    }
}

#[tokio::main]
async fn run() -> Result<i32> {
    let args = Args::parse();
    let quiet = args.quiet;
    let scenarios = load_scenarios(&args)?;
    let output_dir = prepare_output_dir(&args.output_dir)?;

    if !quiet {
        println!("buildscope v{}", env!("CARGO_PKG_VERSION"));
        println!("Output directory: {}", output_dir.display());
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping the current build");
            on_ctrl_c.cancel();
        }
    });

    let mut settings = RunSettings::new(&output_dir);
    settings.event_log = args.log_format.into();
    let adapter = CommandAdapter::new(TokioLauncher { inherit_output: !quiet });
    let runner = ScenarioRunner::new(adapter, settings).with_cancellation(cancel);

    let outcomes = runner.run_all(&scenarios).await?;
    let summary = RunSummary::from_outcomes(&outcomes);

    let summary_path = output_dir.join("summary.json");
    write_summary(&summary_path, &summary)
        .with_context(|| format!("Failed to write {}", summary_path.display()))?;
    info!("Summary written to {}", summary_path.display());

    if !quiet {
        for scenario in &summary.scenarios {
            print_scenario(scenario);
        }
        for rejected in &summary.rejected {
            println!("\n{}: not run: {}", rejected.name, rejected.error);
        }
        println!("\nSummary: {}", summary_path.display());
    }

    let rejected_all = outcomes.iter().all(|o| matches!(o, ScenarioOutcome::Rejected { .. }));
    Ok(if rejected_all {
        EXIT_CONFIG
    } else if summary.all_succeeded() {
        EXIT_SUCCESS
    } else {
        EXIT_ERROR
    })
}
