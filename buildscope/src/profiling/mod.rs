//! Profiler session management
//!
//! - [`backend`] - which profiler a scenario uses and what it can do
//! - [`controller`] - the per-scenario session state machine
//! - [`tally`] - per-iteration totals of agent-reported operations

pub mod backend;
pub mod controller;
pub mod tally;

pub use backend::{Backend, BackendKind, Capabilities};
pub use controller::{ProfilerController, SessionReport, SessionState};
pub use tally::OperationTally;
