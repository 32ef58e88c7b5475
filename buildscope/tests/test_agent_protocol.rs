//! End-to-end runs with a real in-process agent on the other side of the
//! command and event channels.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use buildscope::domain::{IterationError, OperationTotals, Phase, Pid, ProfilingNotSupported};
use buildscope::profiling::BackendKind;
use buildscope::results::{BuildInvocationResult, CaptureStatus};
use buildscope::runner::{
    BuildToolAdapter, EventLogFormat, Invocation, RunSettings, Scenario, ScenarioRunner,
    TrackedOperation,
};
use buildscope_agent::{Agent, AgentConfig};

const RECORDING_WAIT: Duration = Duration::from_secs(2);

/// Plays the measured build tool: attaches the agent from the launch
/// environment and reports a fixed set of operations.
struct AgentAdapter {
    backend: BackendKind,
    /// Long-lived agent of the dynamic backend
    agent: Mutex<Option<Arc<Agent>>>,
    /// Run index at which the dynamic agent goes away
    drop_agent_at: Option<usize>,
    /// Run index after whose operations the dynamic agent goes away
    lose_agent_during: Option<usize>,
    lost: AtomicBool,
    /// Whether the tool loads the agent at all
    instrumented: bool,
    runs: AtomicUsize,
}

impl AgentAdapter {
    fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            agent: Mutex::new(None),
            drop_agent_at: None,
            lose_agent_during: None,
            lost: AtomicBool::new(false),
            instrumented: true,
            runs: AtomicUsize::new(0),
        }
    }

    fn dropping_agent_at(mut self, index: usize) -> Self {
        self.drop_agent_at = Some(index);
        self
    }

    fn losing_agent_during(mut self, index: usize) -> Self {
        self.lose_agent_during = Some(index);
        self
    }

    fn uninstrumented(mut self) -> Self {
        self.instrumented = false;
        self
    }

    fn attach(invocation: &Invocation<'_>) -> Agent {
        let config = AgentConfig::from_lookup(|key| {
            invocation.env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
        .unwrap();
        let agent = Agent::attach(config);
        assert!(agent.is_instrumented());
        agent
    }

    fn long_lived(&self, invocation: &Invocation<'_>, index: usize) -> Option<Arc<Agent>> {
        let mut slot = self.agent.lock().unwrap();
        let dropped = self.drop_agent_at.is_some_and(|at| index >= at);
        if dropped || self.lost.load(Ordering::SeqCst) {
            if let Some(agent) = slot.take() {
                agent.detach();
            }
            return None;
        }
        Some(Arc::clone(slot.get_or_insert_with(|| Arc::new(Self::attach(invocation)))))
    }

    fn release(&self) {
        if let Some(agent) = self.agent.lock().unwrap().take() {
            agent.detach();
        }
    }
}

async fn wait_for_recording(agent: &Agent) {
    let deadline = Instant::now() + RECORDING_WAIT;
    while !agent.is_recording() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

impl BuildToolAdapter for AgentAdapter {
    fn name(&self) -> &str {
        "agent"
    }

    fn supports(&self, _backend: BackendKind) -> Result<(), ProfilingNotSupported> {
        Ok(())
    }

    async fn run(
        &self,
        invocation: &Invocation<'_>,
    ) -> Result<BuildInvocationResult, IterationError> {
        let index = self.runs.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let agent = match self.backend {
            _ if !self.instrumented => None,
            BackendKind::Dynamic => self.long_lived(invocation, index),
            _ => Some(Arc::new(Self::attach(invocation))),
        };

        if let Some(agent) = &agent {
            if invocation.scenario.record.includes(invocation.iteration.phase) {
                wait_for_recording(agent).await;
            }
            agent.record_operation(1, Duration::from_millis(5));
            agent.record_operation(1, Duration::from_millis(7));
            agent.record_operation(2, Duration::from_millis(3));
        }
        if self.lose_agent_during == Some(index) {
            self.lost.store(true, Ordering::SeqCst);
            self.release();
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        if self.backend == BackendKind::StaticAgent {
            if let Some(agent) = &agent {
                agent.detach();
            }
        }
        Ok(BuildInvocationResult::new(invocation.iteration, started.elapsed())
            .with_pid(Some(Pid(std::process::id()))))
    }
}

fn scenario(name: &str, profiler: BackendKind, warmups: usize, iterations: usize) -> Scenario {
    let mut scenario = Scenario::new(name);
    scenario.command = vec!["in-process".to_string()];
    scenario.profiler = profiler;
    scenario.warmups = warmups;
    scenario.iterations = iterations;
    scenario.tracked_operations = vec![TrackedOperation { id: 1, name: "compile".to_string() }];
    scenario
}

fn settings(dir: &std::path::Path) -> RunSettings {
    let mut settings = RunSettings::new(dir);
    settings.event_log = EventLogFormat::JsonLines;
    settings
}

fn expected_compile() -> OperationTotals {
    OperationTotals::new(Duration::from_millis(12), 2)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dynamic_agent_records_measured_builds_only() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScenarioRunner::new(AgentAdapter::new(BackendKind::Dynamic), settings(dir.path()));

    let mut dynamic = scenario("dynamic", BackendKind::Dynamic, 1, 2);
    dynamic.snapshot = true;
    let report = runner.run_scenario(&dynamic).await.unwrap();
    runner.adapter().release();

    assert_eq!(report.results.len(), 3);
    let warmup = &report.results[0];
    assert_eq!(warmup.phase, Phase::Warmup);
    assert_eq!(warmup.profiler, CaptureStatus::NotRecorded);
    assert!(warmup.operations.is_empty());

    for measured in &report.results[1..] {
        assert_eq!(measured.profiler, CaptureStatus::Captured);
        assert_eq!(measured.operations["compile"], expected_compile());
        assert_eq!(measured.operations["operation 2"].count, 1);
    }

    let session = report.session.unwrap();
    assert_eq!(session.agent_connections, 1);
    assert_eq!(session.events_accepted, 6);
    assert_eq!(session.events_rejected, 0);

    let artifacts = dir.path().join("dynamic-artifacts");
    let pid = std::process::id();
    assert!(artifacts.join(format!("buildscope-agent-{pid}-snapshot-1.tsv")).exists());
    assert!(artifacts.join(format!("buildscope-agent-{pid}-snapshot-2.tsv")).exists());
    assert!(artifacts.join(format!("buildscope-agent-{pid}-final.tsv")).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_agent_keeps_timing_and_flags_capture() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScenarioRunner::new(
        AgentAdapter::new(BackendKind::Dynamic).dropping_agent_at(2),
        settings(dir.path()),
    );

    let report = runner.run_scenario(&scenario("lost", BackendKind::Dynamic, 1, 3)).await.unwrap();
    runner.adapter().release();

    // Every build still counts; none failed
    assert_eq!(report.results.len(), 4);
    assert!(report.failures.is_empty());
    assert_eq!(report.results[1].profiler, CaptureStatus::Captured);
    for result in &report.results[2..] {
        assert!(result.profiler.is_missing(), "{:?}", result.profiler);
        assert!(result.execution_time > Duration::ZERO);
    }
    assert!(report.session.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_lost_mid_build_flags_only_that_capture() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScenarioRunner::new(
        AgentAdapter::new(BackendKind::Dynamic).losing_agent_during(2),
        settings(dir.path()),
    );

    let report =
        runner.run_scenario(&scenario("vanishing", BackendKind::Dynamic, 1, 3)).await.unwrap();
    runner.adapter().release();

    assert_eq!(report.results.len(), 4);
    assert!(report.failures.is_empty());
    assert_eq!(report.results[1].profiler, CaptureStatus::Captured);

    // Start reached the agent; only stop found it gone
    let interrupted = &report.results[2];
    match &interrupted.profiler {
        CaptureStatus::Missing { reason } => assert!(reason.contains("'stop'"), "{reason}"),
        other => panic!("expected a missing capture, got {other:?}"),
    }
    assert_eq!(interrupted.operations["compile"], expected_compile());
    assert!(interrupted.execution_time > Duration::ZERO);

    let after = &report.results[3];
    assert!(after.profiler.is_missing(), "{:?}", after.profiler);
    assert!(after.operations.is_empty());
    assert!(after.execution_time > Duration::ZERO);

    assert_eq!(report.session.unwrap().agent_connections, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_static_agent_that_never_connects_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ScenarioRunner::new(
        AgentAdapter::new(BackendKind::StaticAgent).uninstrumented(),
        settings(dir.path()),
    );

    let report =
        runner.run_scenario(&scenario("bare", BackendKind::StaticAgent, 0, 2)).await.unwrap();

    assert_eq!(report.results.len(), 2);
    assert!(report.failures.is_empty());
    for result in &report.results {
        assert_eq!(
            result.profiler,
            CaptureStatus::Missing { reason: "agent never connected".to_string() }
        );
        assert!(result.operations.is_empty());
    }
    assert_eq!(report.session.unwrap().agent_connections, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_static_agent_reports_whole_process() {
    let dir = tempfile::tempdir().unwrap();
    let runner =
        ScenarioRunner::new(AgentAdapter::new(BackendKind::StaticAgent), settings(dir.path()));

    let report =
        runner.run_scenario(&scenario("static", BackendKind::StaticAgent, 0, 2)).await.unwrap();

    assert_eq!(report.results.len(), 2);
    for result in &report.results {
        assert_eq!(result.profiler, CaptureStatus::AtExit);
        assert_eq!(result.operations["compile"], expected_compile());
    }

    let session = report.session.unwrap();
    assert_eq!(session.agent_connections, 2);
    assert_eq!(session.events_accepted, 6);

    let final_artifact = dir
        .path()
        .join("static-artifacts")
        .join(format!("buildscope-agent-{}-final.tsv", std::process::id()));
    let body = std::fs::read_to_string(final_artifact).unwrap();
    assert!(body.contains("1\t2\t12"));
}
