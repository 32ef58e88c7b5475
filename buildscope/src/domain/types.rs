//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep process ids, operation ids and iteration
//! bookkeeping from being mixed up in function signatures.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Process ID of a measured target process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Operation identifier reported by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub i64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation {}", self.0)
    }
}

/// Whether an iteration feeds the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Executed to reach steady state, excluded from statistics
    Warmup,
    Measured,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Warmup => f.write_str("warm-up"),
            Phase::Measured => f.write_str("measured"),
        }
    }
}

/// One pass of the scenario loop.
///
/// `index` counts every iteration of the scenario from 0; `ordinal` counts
/// from 1 within the phase ("warm-up build #2", "measured build #1").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Iteration {
    pub index: usize,
    pub phase: Phase,
    pub ordinal: usize,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl Iteration {
    /// Work out phase and ordinal of the iteration at `index`.
    #[must_use]
    pub fn at(index: usize, warmup_count: usize) -> Self {
        let (phase, ordinal) = if index < warmup_count {
            (Phase::Warmup, index + 1)
        } else {
            (Phase::Measured, index - warmup_count + 1)
        };
        Self { index, phase, ordinal, started_at: None, finished_at: None }
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn mark_finished(&mut self) {
        self.finished_at = Some(Instant::now());
    }

    /// Wall-clock time between start and finish marks, if both were set.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        Some(self.finished_at?.saturating_duration_since(self.started_at?))
    }

    /// Human-readable label, e.g. `measured build #3`.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} build #{}", self.phase, self.ordinal)
    }
}

impl fmt::Display for Iteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Accumulated duration and occurrence count of one sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OperationTotals {
    #[serde(serialize_with = "serialize_millis", rename = "total_ms")]
    pub total: Duration,
    pub count: u32,
}

impl OperationTotals {
    #[must_use]
    pub fn new(total: Duration, count: u32) -> Self {
        Self { total, count }
    }

    pub fn add(&mut self, duration: Duration) {
        self.total += duration;
        self.count = self.count.saturating_add(1);
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
pub(crate) fn serialize_millis<S: serde::Serializer>(
    d: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64() * 1000.0)
}
