//! Profiler backends and what each one can do.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Backend selected by a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Time builds only
    #[default]
    None,
    /// Agent recording is switched on and off by the controller
    Dynamic,
    /// Agent records from process start and finalizes at exit
    StaticAgent,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::None => "none",
            BackendKind::Dynamic => "dynamic",
            BackendKind::StaticAgent => "static-agent",
        })
    }
}

/// Capability flags callers branch on before touching the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// `start`/`stop` reach the agent; otherwise they only move the state machine
    pub start_stop: bool,
    /// `capture_snapshot` is allowed
    pub snapshots: bool,
    /// The measured process reports operation events
    pub events: bool,
}

/// A configured backend. Built by preflight only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    None,
    Dynamic {
        /// Where the agent listens for commands
        command_addr: SocketAddr,
        command_timeout: Duration,
        /// Where the agent writes snapshot and final artifacts
        artifact_dir: Option<PathBuf>,
    },
    StaticAgent {
        /// Where the agent writes its at-exit artifacts
        artifact_dir: Option<PathBuf>,
    },
}

impl Backend {
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::None => BackendKind::None,
            Backend::Dynamic { .. } => BackendKind::Dynamic,
            Backend::StaticAgent { .. } => BackendKind::StaticAgent,
        }
    }

    #[must_use]
    pub fn artifact_dir(&self) -> Option<&Path> {
        match self {
            Backend::None => None,
            Backend::Dynamic { artifact_dir, .. } | Backend::StaticAgent { artifact_dir } => {
                artifact_dir.as_deref()
            }
        }
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.kind().capabilities()
    }
}

impl BackendKind {
    /// What this backend can do, known before it is configured.
    #[must_use]
    pub fn capabilities(self) -> Capabilities {
        match self {
            BackendKind::None => Capabilities { start_stop: false, snapshots: false, events: false },
            BackendKind::Dynamic => Capabilities { start_stop: true, snapshots: true, events: true },
            BackendKind::StaticAgent => {
                Capabilities { start_stop: false, snapshots: false, events: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_cli_values() {
        for kind in BackendKind::value_variants() {
            let cli = kind.to_possible_value().unwrap();
            assert_eq!(cli.get_name(), kind.to_string());
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_only_dynamic_is_controllable() {
        let dynamic = Backend::Dynamic {
            command_addr: "127.0.0.1:1".parse().unwrap(),
            command_timeout: Duration::from_secs(1),
            artifact_dir: None,
        };
        assert!(dynamic.capabilities().start_stop);
        assert!(dynamic.capabilities().snapshots);

        let at_exit = Backend::StaticAgent { artifact_dir: None };
        assert!(!at_exit.capabilities().start_stop);
        assert!(at_exit.capabilities().events);
        assert_eq!(at_exit.kind(), BackendKind::StaticAgent);
        assert!(!Backend::None.capabilities().events);
    }

    #[test]
    fn test_configured_backend_reports_kind_capabilities() {
        let backends = [
            Backend::None,
            Backend::Dynamic {
                command_addr: "127.0.0.1:1".parse().unwrap(),
                command_timeout: Duration::from_secs(1),
                artifact_dir: None,
            },
            Backend::StaticAgent { artifact_dir: None },
        ];
        for backend in &backends {
            assert_eq!(backend.capabilities(), backend.kind().capabilities());
        }
        assert!(BackendKind::Dynamic.capabilities().snapshots);
        assert!(!BackendKind::StaticAgent.capabilities().snapshots);
    }
}
