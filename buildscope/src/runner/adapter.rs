//! Build-tool adapters: run one invocation of the measured tool.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::process::{wait_bounded, LaunchSpec, ProcessLauncher, TargetProcess, TokioLauncher};
use super::scenario::Scenario;
use crate::domain::{Iteration, IterationError, ProfilingNotSupported};
use crate::profiling::BackendKind;
use crate::results::BuildInvocationResult;

/// Settings for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    pub scenario: &'a Scenario,
    pub iteration: &'a Iteration,
    /// Scenario environment plus what the profiler session needs
    pub env: &'a [(String, String)],
    pub timeout: Duration,
    pub cancel: &'a CancellationToken,
}

pub trait BuildToolAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the tool can run under `backend`.
    ///
    /// # Errors
    /// Returns [`ProfilingNotSupported`] for an incompatible backend.
    fn supports(&self, backend: BackendKind) -> Result<(), ProfilingNotSupported>;

    /// Adapter-specific scenario checks, run before anything launches.
    ///
    /// # Errors
    /// Returns the reason the scenario cannot run.
    fn validate(&self, _scenario: &Scenario) -> Result<(), String> {
        Ok(())
    }

    fn run(
        &self,
        invocation: &Invocation<'_>,
    ) -> impl Future<Output = Result<BuildInvocationResult, IterationError>> + Send;
}

/// Runs the scenario's command line as a fresh process per iteration.
///
/// A process that does not exist yet cannot be told to start recording, so
/// the dynamic backend is not supported; the static agent records for the
/// whole process instead.
#[derive(Debug, Clone, Default)]
pub struct CommandAdapter<L = TokioLauncher> {
    launcher: L,
}

impl<L: ProcessLauncher> CommandAdapter<L> {
    #[must_use]
    pub fn new(launcher: L) -> Self {
        Self { launcher }
    }

    fn launch_spec(invocation: &Invocation<'_>) -> LaunchSpec {
        let scenario = invocation.scenario;
        let (program, args) = match scenario.command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let env = scenario
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(invocation.env.iter().cloned())
            .collect();
        LaunchSpec { program, args, env, working_dir: scenario.working_dir.clone() }
    }
}

impl<L: ProcessLauncher> BuildToolAdapter for CommandAdapter<L> {
    fn name(&self) -> &str {
        "command"
    }

    fn supports(&self, backend: BackendKind) -> Result<(), ProfilingNotSupported> {
        match backend {
            BackendKind::None | BackendKind::StaticAgent => Ok(()),
            BackendKind::Dynamic => {
                Err(ProfilingNotSupported { adapter: self.name().to_string(), backend })
            }
        }
    }

    fn validate(&self, scenario: &Scenario) -> Result<(), String> {
        match scenario.command.first() {
            Some(program) if !program.trim().is_empty() => Ok(()),
            _ => Err("no command to run".to_string()),
        }
    }

    async fn run(
        &self,
        invocation: &Invocation<'_>,
    ) -> Result<BuildInvocationResult, IterationError> {
        let spec = Self::launch_spec(invocation);
        let started = Instant::now();
        let mut process = self.launcher.spawn(&spec)?;
        let pid = process.pid();

        let outcome = wait_bounded(&mut process, invocation.timeout, invocation.cancel).await?;
        let elapsed = started.elapsed();
        if !outcome.success() {
            return Err(IterationError::NonZeroExit { code: outcome.code });
        }
        Ok(BuildInvocationResult::new(invocation.iteration, elapsed).with_pid(pid))
    }
}
