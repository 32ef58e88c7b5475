//! Per-iteration and per-scenario results.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::domain::types::serialize_millis;
use crate::domain::{Iteration, OperationId, OperationTotals, Phase, Pid};
use crate::profiling::{BackendKind, SessionReport};

/// What the profiler produced for one iteration. Never silently absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CaptureStatus {
    /// No profiler, or this phase is not recorded
    NotRecorded,
    /// Recording was started and stopped around the iteration
    Captured,
    /// The agent records for the whole process and finalizes at exit
    AtExit,
    /// Profiling was expected but did not happen
    Missing { reason: String },
}

impl CaptureStatus {
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, CaptureStatus::Missing { .. })
    }
}

/// Outcome of one successful build invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildInvocationResult {
    pub phase: Phase,
    pub ordinal: usize,
    pub display_name: String,
    #[serde(serialize_with = "serialize_millis", rename = "execution_time_ms")]
    pub execution_time: Duration,
    /// Named sub-operations, from the adapter or the agent
    pub operations: BTreeMap<String, OperationTotals>,
    pub profiler: CaptureStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<Pid>,
}

impl BuildInvocationResult {
    #[must_use]
    pub fn new(iteration: &Iteration, execution_time: Duration) -> Self {
        Self {
            phase: iteration.phase,
            ordinal: iteration.ordinal,
            display_name: iteration.display_name(),
            execution_time,
            operations: BTreeMap::new(),
            profiler: CaptureStatus::NotRecorded,
            pid: None,
        }
    }

    #[must_use]
    pub fn with_pid(mut self, pid: Option<Pid>) -> Self {
        self.pid = pid;
        self
    }

    /// Merge agent-reported totals, naming ids through `names`.
    ///
    /// Values the adapter already reported under the same name win.
    pub fn merge_operations(
        &mut self,
        totals: BTreeMap<OperationId, OperationTotals>,
        names: &BTreeMap<OperationId, String>,
    ) {
        for (id, totals) in totals {
            let name = names.get(&id).cloned().unwrap_or_else(|| id.to_string());
            self.operations.entry(name).or_insert(totals);
        }
    }
}

/// An iteration that did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationFailure {
    pub phase: Phase,
    pub ordinal: usize,
    pub display_name: String,
    pub backend: BackendKind,
    pub error: String,
}

impl IterationFailure {
    #[must_use]
    pub fn new(iteration: &Iteration, backend: BackendKind, error: &dyn std::error::Error) -> Self {
        Self {
            phase: iteration.phase,
            ordinal: iteration.ordinal,
            display_name: iteration.display_name(),
            backend,
            error: error.to_string(),
        }
    }
}

/// Everything one scenario execution produced.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub backend: BackendKind,
    pub warmups: usize,
    pub iterations: usize,
    pub results: Vec<BuildInvocationResult>,
    pub failures: Vec<IterationFailure>,
    /// Set when the failure policy stopped the scenario early
    pub aborted: bool,
    pub session: Option<SessionReport>,
    pub event_log: Option<PathBuf>,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(name: &str, backend: BackendKind, warmups: usize, iterations: usize) -> Self {
        Self {
            name: name.to_string(),
            backend,
            warmups,
            iterations,
            results: Vec::new(),
            failures: Vec::new(),
            aborted: false,
            session: None,
            event_log: None,
        }
    }

    /// Iterations that ran, successfully or not.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    #[must_use]
    pub fn measured(&self) -> impl Iterator<Item = &BuildInvocationResult> {
        self.results.iter().filter(|r| r.phase == Phase::Measured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_adapter_values_and_names_untracked_ids() {
        let mut result = BuildInvocationResult::new(&Iteration::at(0, 0), Duration::from_millis(10));
        result
            .operations
            .insert("compile".to_string(), OperationTotals::new(Duration::from_millis(3), 1));

        let names = BTreeMap::from([(OperationId(1), "compile".to_string())]);
        let totals = BTreeMap::from([
            (OperationId(1), OperationTotals::new(Duration::from_millis(99), 9)),
            (OperationId(2), OperationTotals::new(Duration::from_millis(4), 2)),
        ]);
        result.merge_operations(totals, &names);

        assert_eq!(result.operations["compile"].count, 1);
        assert_eq!(result.operations["operation 2"].count, 2);
    }

    #[test]
    fn test_missing_capture_serializes_with_reason() {
        let status = CaptureStatus::Missing { reason: "agent unreachable".to_string() };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "missing");
        assert_eq!(json["reason"], "agent unreachable");
    }
}
