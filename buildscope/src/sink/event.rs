//! Event records appended to the event log.

use std::time::{SystemTime, UNIX_EPOCH};

use buildscope_common::OperationEvent;
use serde::Serialize;

use crate::domain::{Iteration, Phase};

/// One immutable record of the event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Microseconds since the Unix epoch, taken when the event was created
    pub timestamp_us: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A tracked operation completed inside the measured process
    Operation { operation_id: i64, duration_ms: i64 },
    IterationStarted { phase: Phase, ordinal: usize },
    IterationFinished { phase: Phase, ordinal: usize, duration_ms: f64, succeeded: bool },
    /// A command sent to the agent, and whether it got through
    ProfilerCommand { command: String, delivered: bool },
}

impl EventKind {
    #[must_use]
    pub fn iteration_started(iteration: &Iteration) -> Self {
        EventKind::IterationStarted { phase: iteration.phase, ordinal: iteration.ordinal }
    }

    #[must_use]
    pub fn iteration_finished(iteration: &Iteration, succeeded: bool) -> Self {
        EventKind::IterationFinished {
            phase: iteration.phase,
            ordinal: iteration.ordinal,
            duration_ms: iteration.elapsed().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
            succeeded,
        }
    }
}

impl Event {
    #[must_use]
    pub fn now(kind: EventKind) -> Self {
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX));
        Self { timestamp_us, kind }
    }

    #[must_use]
    pub fn operation(event: OperationEvent) -> Self {
        Self::now(EventKind::Operation {
            operation_id: event.operation_id,
            duration_ms: event.duration_ms,
        })
    }

    /// Short name for the event kind, used as the trace event name.
    #[must_use]
    pub fn name(&self) -> String {
        match &self.kind {
            EventKind::Operation { operation_id, .. } => format!("operation {operation_id}"),
            EventKind::IterationStarted { phase, ordinal }
            | EventKind::IterationFinished { phase, ordinal, .. } => {
                format!("{phase} build #{ordinal}")
            }
            EventKind::ProfilerCommand { command, .. } => format!("profiler {command}"),
        }
    }
}
