//! CLI argument definitions

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::profiling::BackendKind;
use crate::runner::{
    ClearDirectory, EventLogFormat, FailurePolicy, MutationSchedule, RecordingScope, Scenario,
};

/// Event log format selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Trace,
    Jsonl,
}

impl From<LogFormat> for EventLogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Trace => EventLogFormat::ChromeTrace,
            LogFormat::Jsonl => EventLogFormat::JsonLines,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "buildscope",
    about = "Benchmark repeated build invocations and profile them",
    after_help = "\
EXAMPLES:
    buildscope -- make -j8                         5 measured builds after 2 warm-ups
    buildscope -n 10 -w 0 --name clean -- make     10 cold builds
    buildscope --profiler static-agent -- ./build  Collect agent-reported operations
    buildscope --scenario-file scenarios.json      Run every scenario in a file"
)]
pub struct Args {
    /// Build command and its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    /// Scenario name (used for output file names)
    #[arg(long, default_value = "default")]
    pub name: String,

    /// Warm-up builds, excluded from statistics
    #[arg(short, long, default_value = "2")]
    pub warmups: usize,

    /// Measured builds
    #[arg(short = 'n', long, default_value = "5")]
    pub iterations: usize,

    /// Profiler backend
    #[arg(long, value_enum, default_value_t = BackendKind::None)]
    pub profiler: BackendKind,

    /// Phases recorded by a dynamic profiler
    #[arg(long, value_enum, default_value_t = RecordingScope::Measured)]
    pub record: RecordingScope,

    /// Capture a profiler snapshot after each recorded build
    #[arg(long)]
    pub snapshot: bool,

    /// Per-build timeout in seconds
    #[arg(long, default_value = "600")]
    pub timeout: u64,

    /// Keep going after a failed build instead of skipping the rest of the scenario
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Empty this directory before every build (repeatable)
    #[arg(long, value_name = "DIR")]
    pub clear_dir: Vec<PathBuf>,

    /// Read scenarios from a JSON file instead of the command line
    #[arg(long, value_name = "FILE", conflicts_with = "command")]
    pub scenario_file: Option<PathBuf>,

    /// Directory for event logs, agent artifacts and the summary
    #[arg(short, long, default_value = "buildscope-out")]
    pub output_dir: PathBuf,

    /// Event log format
    #[arg(long, value_enum, default_value_t = LogFormat::Trace)]
    pub log_format: LogFormat,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// The single scenario described by the command-line flags.
    #[must_use]
    pub fn scenario(&self) -> Scenario {
        let mut scenario = Scenario::new(self.name.clone());
        scenario.command.clone_from(&self.command);
        scenario.warmups = self.warmups;
        scenario.iterations = self.iterations;
        scenario.profiler = self.profiler;
        scenario.record = self.record;
        scenario.snapshot = self.snapshot;
        scenario.timeout_secs = self.timeout;
        scenario.failure_policy = if self.continue_on_failure {
            FailurePolicy::Continue
        } else {
            FailurePolicy::AbortScenario
        };
        scenario.clear_directories = self
            .clear_dir
            .iter()
            .map(|dir| ClearDirectory {
                target: dir.clone(),
                schedule: MutationSchedule::Build,
                keep: Vec::new(),
            })
            .collect();
        scenario
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_command_keeps_its_flags() {
        let args = Args::parse_from(["buildscope", "-n", "3", "--", "make", "-j8", "--keep-going"]);
        assert_eq!(args.command, ["make", "-j8", "--keep-going"]);
        let scenario = args.scenario();
        assert_eq!(scenario.iterations, 3);
        assert_eq!(scenario.warmups, 2);
        assert_eq!(scenario.failure_policy, FailurePolicy::AbortScenario);
    }

    #[test]
    fn test_profiler_values() {
        let args = Args::parse_from(["buildscope", "--profiler", "static-agent", "--", "true"]);
        assert_eq!(args.profiler, BackendKind::StaticAgent);
        assert!(Args::try_parse_from(["buildscope", "--profiler", "perf", "--", "true"]).is_err());
    }

    #[test]
    fn test_scenario_file_conflicts_with_command() {
        assert!(Args::try_parse_from(["buildscope", "--scenario-file", "s.json", "--", "make"])
            .is_err());
    }
}
