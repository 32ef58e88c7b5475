//! Pre-flight checks for a scenario
//!
//! Everything that can rule a scenario out is checked here, before any
//! process is launched: iteration counts, adapter-specific settings and
//! whether the adapter can host the selected profiler. The only way to get a
//! [`CompatibleBackend`] (and therefore a
//! [`ProfilerController`](crate::profiling::ProfilerController)) is to pass
//! these checks.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

use crate::domain::{ConfigurationError, RunError};
use crate::profiling::{Backend, BackendKind};
use crate::runner::{BuildToolAdapter, Scenario};

/// A backend known to work with the scenario's adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibleBackend {
    scenario: String,
    backend: Backend,
}

impl CompatibleBackend {
    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub(crate) fn into_parts(self) -> (String, Backend) {
        (self.scenario, self.backend)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(scenario: &str, backend: Backend) -> Self {
        Self { scenario: scenario.to_string(), backend }
    }
}

/// Validate `scenario` against `adapter` and configure its backend.
///
/// `artifact_dir` is where an agent writes its artifacts.
///
/// # Errors
/// Returns a [`ConfigurationError`] describing the first problem found.
pub fn check_compatibility<A: BuildToolAdapter>(
    scenario: &Scenario,
    adapter: &A,
    artifact_dir: &Path,
    command_timeout: Duration,
) -> Result<CompatibleBackend, ConfigurationError> {
    let name = &scenario.name;
    let invalid = |reason: &str| ConfigurationError::InvalidScenario {
        scenario: name.clone(),
        reason: reason.to_string(),
    };

    if scenario.iterations == 0 {
        return Err(invalid("at least one measured iteration is required"));
    }
    if scenario.timeout_secs == 0 {
        return Err(invalid("the iteration timeout must be at least one second"));
    }
    adapter.validate(scenario).map_err(|reason| invalid(&reason))?;
    adapter
        .supports(scenario.profiler)
        .map_err(|source| ConfigurationError::ProfilingUnavailable { scenario: name.clone(), source })?;

    if scenario.snapshot && !scenario.profiler.capabilities().snapshots {
        return Err(ConfigurationError::SnapshotUnsupported {
            scenario: name.clone(),
            backend: scenario.profiler,
        });
    }

    let backend = match scenario.profiler {
        BackendKind::None => Backend::None,
        BackendKind::Dynamic => Backend::Dynamic {
            command_addr: reserve_loopback_addr().map_err(|source| {
                ConfigurationError::NoCommandPort { scenario: name.clone(), source }
            })?,
            command_timeout,
            artifact_dir: Some(artifact_dir.to_path_buf()),
        },
        BackendKind::StaticAgent => {
            Backend::StaticAgent { artifact_dir: Some(artifact_dir.to_path_buf()) }
        }
    };

    debug!("Scenario '{name}': '{}' profiler is compatible with the {} adapter", backend.kind(), adapter.name());
    Ok(CompatibleBackend { scenario: name.clone(), backend })
}

/// Pick a free loopback port for the agent's command listener.
///
/// The port is released again before returning; the agent binds it when the
/// measured process starts.
///
/// # Errors
/// Returns the bind error.
pub fn reserve_loopback_addr() -> io::Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    listener.local_addr()
}

/// Create the output directory (and parents).
///
/// # Errors
/// Returns [`RunError::OutputDir`] if it cannot be created.
pub fn prepare_output_dir(path: &Path) -> Result<PathBuf, RunError> {
    std::fs::create_dir_all(path)
        .map_err(|source| RunError::OutputDir { path: path.to_path_buf(), source })?;
    Ok(path.to_path_buf())
}
