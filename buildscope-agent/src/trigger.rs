//! Trigger hooks: a side effect bound to a lifecycle point of the measured process.
//!
//! The hosting adapter decides where each point is reached and calls into the
//! agent; the agent runs every trigger registered for that point.

use std::fmt;

use buildscope_common::OperationEvent;

use crate::Agent;

/// Lifecycle point inside the measured process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerPoint {
    /// The agent finished attaching.
    ProcessStart,
    /// A tracked operation completed while recording.
    OperationFinished,
    /// The agent is detaching.
    ProcessExit,
}

/// What a trigger sees when it fires.
pub struct TriggerContext<'a> {
    pub point: TriggerPoint,
    pub agent: &'a Agent,
    /// The completed operation, for `OperationFinished`.
    pub operation: Option<OperationEvent>,
}

type Callback = Box<dyn Fn(&TriggerContext<'_>) + Send + Sync>;

pub struct Trigger {
    point: TriggerPoint,
    on_trigger: Callback,
}

impl Trigger {
    /// Runs `on_trigger` every time `point` is reached.
    ///
    /// Callbacks run on the caller's thread. Use [`Agent::emit`] rather than
    /// [`Agent::record_operation`] from inside a callback so triggers do not
    /// re-enter themselves.
    pub fn new(
        point: TriggerPoint,
        on_trigger: impl Fn(&TriggerContext<'_>) + Send + Sync + 'static,
    ) -> Self {
        Self { point, on_trigger: Box::new(on_trigger) }
    }

    /// Request a snapshot artifact whenever `point` is reached.
    #[must_use]
    pub fn snapshot_on(point: TriggerPoint) -> Self {
        Self::new(point, |ctx| ctx.agent.request_snapshot())
    }

    /// Forward a fixed operation id, with zero duration, whenever `point` is reached.
    #[must_use]
    pub fn marker_on(point: TriggerPoint, operation_id: i64) -> Self {
        Self::new(point, move |ctx| ctx.agent.emit(OperationEvent::new(operation_id, 0)))
    }

    #[must_use]
    pub fn point(&self) -> TriggerPoint {
        self.point
    }

    pub(crate) fn fire(&self, ctx: &TriggerContext<'_>) {
        (self.on_trigger)(ctx);
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger").field("point", &self.point).finish_non_exhaustive()
    }
}
