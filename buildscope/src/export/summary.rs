//! JSON summary of a whole run.
//!
//! One entry per scenario with every iteration row (including explicit
//! `missing` capture markers), every failure and the per-sample statistics
//! over the measured phase.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::analysis::{SampleAggregator, Statistics};
use crate::domain::SinkError;
use crate::profiling::{BackendKind, SessionReport};
use crate::results::{BuildInvocationResult, IterationFailure, ScenarioReport};
use crate::runner::ScenarioOutcome;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub backend: BackendKind,
    pub warmups: usize,
    pub iterations: usize,
    pub attempted: usize,
    pub aborted: bool,
    /// Iterations whose profiler capture is missing
    pub missing_captures: usize,
    pub results: Vec<BuildInvocationResult>,
    pub failures: Vec<IterationFailure>,
    pub statistics: Vec<Statistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log: Option<PathBuf>,
}

impl ScenarioSummary {
    #[must_use]
    pub fn from_report(report: &ScenarioReport) -> Self {
        let statistics = SampleAggregator::for_results(&report.results).aggregate(&report.results);
        Self {
            name: report.name.clone(),
            backend: report.backend,
            warmups: report.warmups,
            iterations: report.iterations,
            attempted: report.attempted(),
            aborted: report.aborted,
            missing_captures: report.results.iter().filter(|r| r.profiler.is_missing()).count(),
            results: report.results.clone(),
            failures: report.failures.clone(),
            statistics,
            session: report.session.clone(),
            event_log: report.event_log.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedScenario {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub scenarios: Vec<ScenarioSummary>,
    pub rejected: Vec<RejectedScenario>,
}

impl RunSummary {
    #[must_use]
    pub fn from_outcomes(outcomes: &[ScenarioOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome {
                ScenarioOutcome::Completed(report) => {
                    summary.scenarios.push(ScenarioSummary::from_report(report));
                }
                ScenarioOutcome::Rejected { scenario, error } => {
                    summary.rejected.push(RejectedScenario {
                        name: scenario.clone(),
                        error: error.to_string(),
                    });
                }
            }
        }
        summary
    }

    /// Whether every scenario ran all of its iterations without failure.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.rejected.is_empty()
            && self.scenarios.iter().all(|s| s.failures.is_empty() && !s.aborted)
    }
}

/// Write `summary` as pretty-printed JSON.
///
/// # Errors
/// Returns [`SinkError::Create`] or [`SinkError::Write`].
pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<(), SinkError> {
    let file = File::create(path)
        .map_err(|source| SinkError::Create { path: path.to_path_buf(), source })?;
    let write_err = |source| SinkError::Write { target: path.display().to_string(), source };

    let mut out = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut out, summary).map_err(|e| write_err(e.into()))?;
    out.write_all(b"\n").map_err(write_err)?;
    out.flush().map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Iteration, OperationTotals};
    use crate::results::CaptureStatus;
    use std::time::Duration;

    fn report() -> ScenarioReport {
        let mut report = ScenarioReport::new("assemble", BackendKind::Dynamic, 1, 2);
        for (index, ms) in [(0, 100), (1, 50), (2, 70)] {
            let mut result =
                BuildInvocationResult::new(&Iteration::at(index, 1), Duration::from_millis(ms));
            result.profiler = CaptureStatus::Captured;
            result
                .operations
                .insert("compile".to_string(), OperationTotals::new(Duration::from_millis(5), 1));
            report.results.push(result);
        }
        report.results[2].profiler = CaptureStatus::Missing { reason: "agent gone".to_string() };
        report
    }

    #[test]
    fn test_summary_flags_missing_capture_and_keeps_timing() {
        let summary = ScenarioSummary::from_report(&report());
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.missing_captures, 1);

        let time = summary.statistics.iter().find(|s| s.name == "execution time").unwrap();
        assert_eq!(time.iterations, 2);
        assert!((time.mean - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_written_summary_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let summary = RunSummary {
            scenarios: vec![ScenarioSummary::from_report(&report())],
            rejected: vec![RejectedScenario { name: "x".to_string(), error: "bad".to_string() }],
        };
        write_summary(&path, &summary).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let rows = parsed["scenarios"][0]["results"].as_array().unwrap();
        assert_eq!(rows[2]["profiler"]["status"], "missing");
        assert_eq!(rows[2]["execution_time_ms"], 70.0);
        assert_eq!(parsed["rejected"][0]["name"], "x");
        assert!(!summary.all_succeeded());
    }
}
