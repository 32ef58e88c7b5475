//! Structured error types for buildscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Each enum matches one class of failure and how far it propagates:
//!
//! - [`ConfigurationError`] - aborts one scenario before any process launches
//! - [`IterationError`] - one build failed; the scenario's failure policy applies
//! - [`AgentCommunicationError`] - profiler data for one iteration is missing
//! - [`SinkError`] / [`RunError::Artifact`] - output cannot be written; aborts the run

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use buildscope_common::ControlCommand;
use thiserror::Error;

use crate::profiling::{BackendKind, SessionState};

/// Signalled by a build-tool adapter asked to run under a profiler it cannot host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("the {adapter} adapter does not support the '{backend}' profiler")]
pub struct ProfilingNotSupported {
    pub adapter: String,
    pub backend: BackendKind,
}

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Scenario '{scenario}': {source}")]
    ProfilingUnavailable {
        scenario: String,
        #[source]
        source: ProfilingNotSupported,
    },

    #[error("Scenario '{scenario}': profiler '{backend}' cannot capture snapshots")]
    SnapshotUnsupported { scenario: String, backend: BackendKind },

    #[error("Scenario '{scenario}': {reason}")]
    InvalidScenario { scenario: String, reason: String },

    #[error("Scenario '{scenario}': output name '{stem}' is already used by another scenario")]
    DuplicateOutput { scenario: String, stem: String },

    #[error("Scenario '{scenario}': cannot reserve a command port for the agent: {source}")]
    NoCommandPort {
        scenario: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid scenario file {path}: {reason}")]
    ScenarioFile { path: PathBuf, reason: String },
}

#[derive(Error, Debug)]
pub enum IterationError {
    #[error("build exited with code {}", exit_label(.code))]
    NonZeroExit { code: Option<i32> },

    #[error("build process I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("build exceeded the {0:?} iteration timeout")]
    Timeout(Duration),

    #[error("build was cancelled")]
    Cancelled,

    #[error("build mutator '{mutator}' failed: {message}")]
    Mutator { mutator: String, message: String },
}

#[derive(Error, Debug)]
pub enum AgentCommunicationError {
    #[error("could not connect to agent at {addr} to send '{command}': {source}")]
    Connect {
        addr: SocketAddr,
        command: ControlCommand,
        #[source]
        source: io::Error,
    },

    #[error("failed to send '{command}' to agent at {addr}: {source}")]
    Send {
        addr: SocketAddr,
        command: ControlCommand,
        #[source]
        source: io::Error,
    },

    #[error("timed out sending '{command}' to agent at {addr} after {timeout:?}")]
    Timeout { addr: SocketAddr, command: ControlCommand, timeout: Duration },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("event sink is closed")]
    Closed,

    #[error("could not create event log {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed writing event log {target}: {source}")]
    Write {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("event sink writer thread panicked")]
    WriterPanicked,

    #[error("event log {target} was not closed cleanly: {reason}")]
    Failed { target: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("cannot {action} a profiler session that is {state}")]
    InvalidTransition { action: &'static str, state: SessionState },

    #[error(transparent)]
    Agent(#[from] AgentCommunicationError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("could not open event listener: {0}")]
    Listener(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Scenario '{scenario}': cannot write output artifact: {source}")]
    Artifact {
        scenario: String,
        #[source]
        source: SinkError,
    },

    #[error("Cannot prepare output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Scenario '{scenario}': could not set up profiler session: {source}")]
    Session {
        scenario: String,
        #[source]
        source: ControllerError,
    },

    #[error("Scenario '{scenario}' was cancelled")]
    Cancelled { scenario: String },
}

#[allow(clippy::ref_option)]
fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "<signal>".to_string(), |c| c.to_string())
}

impl RunError {
    /// Whether this error ends the whole run rather than a single scenario.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RunError::Configuration(_))
    }
}
