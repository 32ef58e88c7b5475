//! Export functionality
//!
//! Renderers plug into the [`EventSink`](crate::sink::EventSink) to stream the
//! event log to disk; [`summary`] writes the per-scenario results once a run
//! has finished.
//!
//! - Chrome Trace Event Format for chrome://tracing or Perfetto
//! - JSON lines for scripting (`jq`, pandas)

pub mod chrome_trace;
pub mod json_lines;
pub mod summary;

pub use chrome_trace::ChromeTraceRenderer;
pub use json_lines::JsonLinesRenderer;
pub use summary::{write_summary, RejectedScenario, RunSummary, ScenarioSummary};
