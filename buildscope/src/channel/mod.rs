//! # Control Channel
//!
//! The controller side of the agent protocol:
//!
//! ```text
//!   controller                               measured process
//! ┌──────────────────┐   "start\n" (1 conn/cmd)   ┌──────────────┐
//! │ CommandChannel   │ ─────────────────────────▶ │ agent        │
//! │                  │                            │  listener    │
//! │ EventReceiver    │ ◀───────────────────────── │  writer      │
//! └──────────────────┘  16-byte frames (1 conn)   └──────────────┘
//! ```
//!
//! Commands are fire-and-forget: no acknowledgement, no retry. Events are
//! decoded on tokio tasks and handed to an [`EventHandler`]; ordering holds
//! within one agent connection only.

pub mod command;
pub mod receiver;

pub use command::CommandChannel;
pub use receiver::{EventHandler, EventReceiver, ReceiverStats};
