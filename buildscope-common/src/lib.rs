//! # Shared Protocol (Controller ↔ Agent)
//!
//! Defines the wire format spoken between the controller process and the agent
//! linked into the measured build process. Both sides depend on this crate so
//! the encoding can never drift between them.
//!
//! ## Channels
//!
//! 1. **Command channel** (controller → agent): one short-lived connection per
//!    command, carrying a single ASCII token terminated by `\n`. No reply.
//! 2. **Event channel** (agent → controller): one long-lived connection per
//!    process, carrying fixed-size [`OperationEvent`] frames.
//!
//! ## Key Types
//!
//! - [`ControlCommand`] - Command tokens (`start`, `stop`, `snapshot`, `stop-session`)
//! - [`OperationEvent`] - One completed tracked operation and its duration

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

// ============================================================================
// Launch Environment
// ============================================================================

/// Address of the controller's event listener (`host:port`).
///
/// Set by the controller for every backend that attaches an agent.
pub const ENV_EVENT_ADDR: &str = "BUILDSCOPE_EVENT_ADDR";

/// Address the agent binds for incoming commands (`host:port`).
///
/// Only set for dynamically controlled backends.
pub const ENV_COMMAND_ADDR: &str = "BUILDSCOPE_COMMAND_ADDR";

/// When `1`, the agent starts recording as soon as it attaches.
pub const ENV_RECORD_ON_START: &str = "BUILDSCOPE_RECORD_ON_START";

/// Directory the agent writes its artifacts into on snapshot and at exit.
pub const ENV_ARTIFACT_DIR: &str = "BUILDSCOPE_ARTIFACT_DIR";

// ============================================================================
// Command Channel
// ============================================================================

/// Line delimiter terminating every command token.
pub const COMMAND_DELIMITER: char = '\n';

/// Command sent from the controller to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    /// Begin (or resume) recording.
    Start,
    /// Pause recording.
    Stop,
    /// Write a point-in-time artifact of what has been recorded so far.
    CaptureSnapshot,
    /// End the session and finalize artifacts.
    StopSession,
}

impl ControlCommand {
    /// The plain-text token for this command.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::CaptureSnapshot => "snapshot",
            Self::StopSession => "stop-session",
        }
    }

    /// The token followed by the line delimiter, ready to write to the socket.
    #[must_use]
    pub fn to_line(self) -> String {
        format!("{}{COMMAND_DELIMITER}", self.token())
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for ControlCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "snapshot" => Ok(Self::CaptureSnapshot),
            "stop-session" => Ok(Self::StopSession),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

// ============================================================================
// Event Channel
// ============================================================================

/// Size of one encoded [`OperationEvent`] frame in bytes.
pub const EVENT_FRAME_LEN: usize = 16;

/// A completed tracked operation reported by the agent.
///
/// **Wire layout** (big-endian):
///
/// ```text
/// 0        8                16
/// ┌────────┬────────────────┐
/// │ op id  │ duration (ms)  │
/// └────────┴────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationEvent {
    pub operation_id: i64,
    pub duration_ms: i64,
}

impl OperationEvent {
    #[must_use]
    pub const fn new(operation_id: i64, duration_ms: i64) -> Self {
        Self { operation_id, duration_ms }
    }

    /// Encode into a wire frame.
    #[must_use]
    pub fn encode(&self) -> [u8; EVENT_FRAME_LEN] {
        let mut frame = [0u8; EVENT_FRAME_LEN];
        frame[..8].copy_from_slice(&self.operation_id.to_be_bytes());
        frame[8..].copy_from_slice(&self.duration_ms.to_be_bytes());
        frame
    }

    /// Decode a wire frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError::NegativeDuration`] if the frame carries a
    /// negative duration.
    pub fn decode(frame: &[u8; EVENT_FRAME_LEN]) -> Result<Self, ProtocolError> {
        let mut id = [0u8; 8];
        let mut duration = [0u8; 8];
        id.copy_from_slice(&frame[..8]);
        duration.copy_from_slice(&frame[8..]);

        let event = Self::new(i64::from_be_bytes(id), i64::from_be_bytes(duration));
        if event.duration_ms < 0 {
            return Err(ProtocolError::NegativeDuration {
                operation_id: event.operation_id,
                duration_ms: event.duration_ms,
            });
        }
        Ok(event)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown command token: {0:?}")]
    UnknownCommand(String),

    #[error("Operation {operation_id} reported a negative duration ({duration_ms} ms)")]
    NegativeDuration { operation_id: i64, duration_ms: i64 },
}
