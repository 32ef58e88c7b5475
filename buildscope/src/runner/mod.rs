//! # Scenario Runner
//!
//! Drives the warm-up + measured iteration loop of each scenario:
//!
//! ```text
//! preflight ─▶ event log ─▶ controller.open
//!                               │
//!        ┌──────────────────────┘
//!        ▼
//!   for each iteration:
//!     mutators.before_build
//!     controller.start()        (dynamic backend, recorded phase)
//!     adapter.run()             (bounded by timeout / cancellation)
//!     controller.stop()         (paired with every start)
//!     controller.capture_snapshot()   (if requested)
//!     record result or failure ─▶ failure policy
//!        │
//!        ▼
//!   controller.stop_session()   (always, exactly once)
//! ```
//!
//! Iterations never overlap. A profiler that cannot be reached only marks
//! the iteration's capture as missing; its timing is kept.

pub mod adapter;
pub mod mutator;
pub mod process;
pub mod scenario;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::domain::{
    ConfigurationError, ControllerError, Iteration, IterationError, OperationId, RunError,
};
use crate::export::{ChromeTraceRenderer, JsonLinesRenderer};
use crate::preflight;
use crate::profiling::ProfilerController;
use crate::results::{BuildInvocationResult, CaptureStatus, IterationFailure, ScenarioReport};
use crate::sink::{EventKind, EventSink};

pub use adapter::{BuildToolAdapter, CommandAdapter, Invocation};
pub use mutator::{BuildMutator, ClearDirectory, ClearDirectoryMutator, MutationSchedule};
pub use process::{
    wait_bounded, ExitOutcome, LaunchSpec, ProcessLauncher, TargetProcess, TokioLauncher,
};
pub use scenario::{FailurePolicy, RecordingScope, Scenario, TrackedOperation};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Format of the per-scenario event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventLogFormat {
    #[default]
    ChromeTrace,
    JsonLines,
}

impl EventLogFormat {
    fn extension(self) -> &'static str {
        match self {
            EventLogFormat::ChromeTrace => "trace.json",
            EventLogFormat::JsonLines => "events.jsonl",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Event logs and agent artifacts go here
    pub output_dir: PathBuf,
    /// Bound on delivering one command to the agent
    pub command_timeout: Duration,
    pub event_log: EventLogFormat,
}

impl RunSettings {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            event_log: EventLogFormat::default(),
        }
    }
}

/// Result of one scenario within a run.
#[derive(Debug)]
pub enum ScenarioOutcome {
    Completed(ScenarioReport),
    /// Rejected before any process was launched
    Rejected { scenario: String, error: ConfigurationError },
}

pub struct ScenarioRunner<A> {
    adapter: A,
    settings: RunSettings,
    mutators: Vec<Box<dyn BuildMutator>>,
    cancel: CancellationToken,
}

impl<A: BuildToolAdapter> ScenarioRunner<A> {
    #[must_use]
    pub fn new(adapter: A, settings: RunSettings) -> Self {
        Self { adapter, settings, mutators: Vec::new(), cancel: CancellationToken::new() }
    }

    /// Abort the run when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Apply `mutator` to every scenario, after the scenario's own mutators.
    #[must_use]
    pub fn with_mutator(mut self, mutator: Box<dyn BuildMutator>) -> Self {
        self.mutators.push(mutator);
        self
    }

    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Run every scenario in order.
    ///
    /// A scenario rejected by preflight, or whose output files an earlier
    /// scenario already claimed, is reported and the run continues.
    ///
    /// # Errors
    /// Stops at the first fatal error: output that cannot be written, or
    /// cancellation.
    pub async fn run_all(&self, scenarios: &[Scenario]) -> Result<Vec<ScenarioOutcome>, RunError> {
        let mut outcomes = Vec::with_capacity(scenarios.len());
        let mut stems = HashSet::new();
        for scenario in scenarios {
            let stem = scenario.file_stem();
            let result = if stems.insert(stem.clone()) {
                self.run_scenario(scenario).await
            } else {
                Err(ConfigurationError::DuplicateOutput { scenario: scenario.name.clone(), stem }
                    .into())
            };
            match result {
                Ok(report) => outcomes.push(ScenarioOutcome::Completed(report)),
                Err(RunError::Configuration(error)) => {
                    error!("{error}");
                    outcomes.push(ScenarioOutcome::Rejected { scenario: scenario.name.clone(), error });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// Run one scenario: preflight, every iteration, then close the session.
    ///
    /// # Errors
    /// [`RunError::Configuration`] before anything launched; otherwise a
    /// fatal error, raised only after the profiler session was stopped.
    pub async fn run_scenario(&self, scenario: &Scenario) -> Result<ScenarioReport, RunError> {
        let name = &scenario.name;
        let output_dir = &self.settings.output_dir;
        let artifact_dir = output_dir.join(format!("{}-artifacts", scenario.file_stem()));

        let compatible = preflight::check_compatibility(
            scenario,
            &self.adapter,
            &artifact_dir,
            self.settings.command_timeout,
        )?;
        preflight::prepare_output_dir(output_dir)?;
        if compatible.backend().artifact_dir().is_some() {
            preflight::prepare_output_dir(&artifact_dir)?;
        }

        let log_path = output_dir
            .join(format!("{}.{}", scenario.file_stem(), self.settings.event_log.extension()));
        let sink = match self.settings.event_log {
            EventLogFormat::ChromeTrace => EventSink::create(&log_path, ChromeTraceRenderer::new()),
            EventLogFormat::JsonLines => {
                EventSink::create(&log_path, JsonLinesRenderer::new(name.clone()))
            }
        }
        .map_err(|source| RunError::Artifact { scenario: name.clone(), source })?;

        let mut controller = ProfilerController::open(compatible, sink)
            .await
            .map_err(|source| session_error(name, source))?;

        info!(
            "Scenario '{name}': {} warm-up + {} measured builds, profiler '{}'",
            scenario.warmups,
            scenario.iterations,
            controller.kind()
        );
        let mut report =
            ScenarioReport::new(name, controller.kind(), scenario.warmups, scenario.iterations);
        report.event_log = Some(log_path);

        let looped = self.iterate(scenario, &mut controller, &mut report).await;
        let session = controller.stop_session().await;

        match (looped, session) {
            (Ok(()), Ok(session)) => {
                report.session = Some(session);
                Ok(report)
            }
            (Ok(()), Err(e)) => Err(session_error(name, e)),
            // The writer's own error says more than the closed queue the loop saw
            (Err(RunError::Artifact { .. }), Err(ControllerError::Sink(source))) => {
                Err(RunError::Artifact { scenario: name.clone(), source })
            }
            (Err(e), session) => {
                if let Err(session_err) = session {
                    warn!("Scenario '{name}': {session_err}");
                }
                Err(e)
            }
        }
    }

    async fn iterate(
        &self,
        scenario: &Scenario,
        controller: &mut ProfilerController,
        report: &mut ScenarioReport,
    ) -> Result<(), RunError> {
        let name = &scenario.name;
        let scenario_mutators: Vec<ClearDirectoryMutator> =
            scenario.clear_directories.iter().cloned().map(ClearDirectoryMutator::new).collect();
        let mutators: Vec<&dyn BuildMutator> = scenario_mutators
            .iter()
            .map(|m| m as &dyn BuildMutator)
            .chain(self.mutators.iter().map(|m| &**m))
            .collect();

        for mutator in &mutators {
            if let Err(e) = mutator.before_scenario(scenario) {
                let error = IterationError::Mutator { mutator: mutator.name(), message: format!("{e:#}") };
                error!("Scenario '{name}': {error}");
                let first = Iteration::at(0, scenario.warmups);
                report.failures.push(IterationFailure::new(&first, controller.kind(), &error));
                report.aborted = true;
                return Ok(());
            }
        }

        let env: Vec<(String, String)> = controller.launch_env();
        let names = scenario.operation_names();

        for index in 0..scenario.total_iterations() {
            if self.cancel.is_cancelled() {
                return Err(RunError::Cancelled { scenario: name.clone() });
            }
            let mut iteration = Iteration::at(index, scenario.warmups);
            note(controller, name, EventKind::iteration_started(&iteration))?;

            let outcome = self
                .run_iteration(scenario, controller, &mut iteration, &env, &names, &mutators)
                .await;
            note(controller, name, EventKind::iteration_finished(&iteration, outcome.is_ok()))?;

            match outcome {
                Ok(result) => {
                    info!(
                        "Scenario '{name}': {} took {:.1} ms",
                        result.display_name,
                        result.execution_time.as_secs_f64() * 1000.0
                    );
                    report.results.push(result);
                }
                Err(error) => {
                    let cancelled = matches!(error, IterationError::Cancelled);
                    error!("Scenario '{name}': {iteration} failed: {error}");
                    report.failures.push(IterationFailure::new(&iteration, controller.kind(), &error));
                    if cancelled {
                        return Err(RunError::Cancelled { scenario: name.clone() });
                    }
                    if scenario.failure_policy == FailurePolicy::AbortScenario {
                        warn!("Scenario '{name}': skipping its remaining builds");
                        report.aborted = true;
                        break;
                    }
                }
            }
        }

        for mutator in &mutators {
            if let Err(e) = mutator.after_scenario(scenario) {
                warn!("Scenario '{name}': mutator {} failed after the scenario: {e:#}", mutator.name());
            }
        }
        Ok(())
    }

    async fn run_iteration(
        &self,
        scenario: &Scenario,
        controller: &mut ProfilerController,
        iteration: &mut Iteration,
        env: &[(String, String)],
        names: &BTreeMap<OperationId, String>,
        mutators: &[&dyn BuildMutator],
    ) -> Result<BuildInvocationResult, IterationError> {
        for mutator in mutators {
            mutator.before_build(iteration).map_err(|e| IterationError::Mutator {
                mutator: mutator.name(),
                message: format!("{e:#}"),
            })?;
        }

        let capabilities = controller.capabilities();
        let record = capabilities.start_stop && scenario.record.includes(iteration.phase);
        let mut capture = if record {
            CaptureStatus::Captured
        } else if capabilities.events && !capabilities.start_stop {
            CaptureStatus::AtExit
        } else {
            CaptureStatus::NotRecorded
        };

        if record {
            if let Err(e) = controller.start().await {
                mark_missing(&mut capture, &e);
            }
        }

        iteration.mark_started();
        let invocation = Invocation {
            scenario,
            iteration: &*iteration,
            env,
            timeout: scenario.timeout(),
            cancel: &self.cancel,
        };
        let outcome = self.adapter.run(&invocation).await;
        iteration.mark_finished();

        if record {
            if let Err(e) = controller.stop().await {
                mark_missing(&mut capture, &e);
            }
            if scenario.snapshot && capabilities.snapshots {
                let pid = outcome.as_ref().ok().and_then(|r| r.pid);
                if let Err(e) = controller.capture_snapshot(pid).await {
                    mark_missing(&mut capture, &e);
                }
            }
        }
        let connected = controller.settle().await;
        if capture == CaptureStatus::AtExit && connected == 0 {
            capture = CaptureStatus::Missing { reason: "agent never connected".to_string() };
        }
        let operations = controller.take_operations();

        for mutator in mutators {
            if let Err(e) = mutator.after_build(iteration) {
                warn!("Mutator {} failed after {iteration}: {e:#}", mutator.name());
            }
        }

        let mut result = outcome?;
        result.merge_operations(operations, names);
        if capture.is_missing() {
            warn!("Scenario '{}': no profiler capture for {iteration}", scenario.name);
        }
        result.profiler = capture;
        Ok(result)
    }
}

fn mark_missing(capture: &mut CaptureStatus, error: &ControllerError) {
    if !capture.is_missing() {
        *capture = CaptureStatus::Missing { reason: error.to_string() };
    }
}

fn note(controller: &ProfilerController, scenario: &str, kind: EventKind) -> Result<(), RunError> {
    controller
        .note(kind)
        .map_err(|source| RunError::Artifact { scenario: scenario.to_string(), source })
}

fn session_error(scenario: &str, error: ControllerError) -> RunError {
    match error {
        ControllerError::Sink(source) => RunError::Artifact { scenario: scenario.to_string(), source },
        source => RunError::Session { scenario: scenario.to_string(), source },
    }
}
