//! Launching and bounding target processes.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::domain::{IterationError, Pid};

/// Everything needed to start one target process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

/// How a target process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ExitOutcome {
    #[must_use]
    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

pub trait TargetProcess: Send {
    fn pid(&self) -> Option<Pid>;

    fn wait(&mut self) -> impl Future<Output = io::Result<ExitOutcome>> + Send;

    /// Kill the process and reap it.
    fn kill(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

pub trait ProcessLauncher: Send + Sync {
    type Process: TargetProcess;

    /// # Errors
    /// Returns the spawn error.
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<Self::Process>;
}

/// Launches real processes with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher {
    /// Pass the build's stdout/stderr through instead of discarding them
    pub inherit_output: bool,
}

impl ProcessLauncher for TokioLauncher {
    type Process = TokioProcess;

    fn spawn(&self, spec: &LaunchSpec) -> io::Result<TokioProcess> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if !self.inherit_output {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        debug!("Spawned {} (pid {:?})", spec.program, child.id());
        Ok(TokioProcess { child })
    }
}

pub struct TokioProcess {
    child: Child,
}

impl TargetProcess for TokioProcess {
    fn pid(&self) -> Option<Pid> {
        self.child.id().map(Pid)
    }

    async fn wait(&mut self) -> io::Result<ExitOutcome> {
        let status = self.child.wait().await?;
        Ok(ExitOutcome { code: status.code() })
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Wait for `process`, killing it on timeout or cancellation.
///
/// # Errors
/// [`IterationError::Timeout`] or [`IterationError::Cancelled`] after the
/// process was killed, or [`IterationError::Io`] if waiting failed.
pub async fn wait_bounded<P: TargetProcess>(
    process: &mut P,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ExitOutcome, IterationError> {
    let interrupted = tokio::select! {
        status = process.wait() => return Ok(status?),
        () = tokio::time::sleep(timeout) => IterationError::Timeout(timeout),
        () = cancel.cancelled() => IterationError::Cancelled,
    };

    if let Err(e) = process.kill().await {
        warn!("Failed to kill target process {:?}: {e}", process.pid());
    }
    Err(interrupted)
}
