//! Chrome Trace Event Format renderer for the event log.
//!
//! The log is written incrementally: the opening of the `traceEvents` array is
//! the header, each event is one array element, and the closing brackets are
//! the footer. Trace viewers (Perfetto, `chrome://tracing`) load a file whose
//! array was never closed, so a log cut short by a crash stays usable.

use std::collections::HashMap;
use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::sink::{Event, EventKind, Renderer};

/// Track (trace "thread") each event kind is drawn on
const TID_ITERATIONS: u32 = 1;
const TID_OPERATIONS: u32 = 2;
const TID_PROFILER: u32 = 3;

/// Chrome Trace Event format
/// Spec: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview
#[derive(Debug, Clone, Serialize)]
struct ChromeTraceEvent {
    name: String,
    cat: &'static str,
    /// Phase: "B" = begin, "E" = end, "X" = complete, "i" = instant, "M" = metadata
    ph: &'static str,
    /// Timestamp in microseconds
    ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    pid: u32,
    tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<HashMap<&'static str, JsonValue>>,
}

/// Streams [`Event`]s as a Chrome trace.
pub struct ChromeTraceRenderer {
    pid: u32,
    /// Timestamps are written relative to the first event
    start_us: Option<u64>,
    wrote_any: bool,
}

impl ChromeTraceRenderer {
    #[must_use]
    pub fn new() -> Self {
        Self { pid: std::process::id(), start_us: None, wrote_any: false }
    }

    fn write_element(&mut self, event: &ChromeTraceEvent, out: &mut dyn Write) -> io::Result<()> {
        if self.wrote_any {
            out.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut *out, event)?;
        self.wrote_any = true;
        Ok(())
    }

    fn thread_name(&self, tid: u32, name: &str) -> ChromeTraceEvent {
        ChromeTraceEvent {
            name: "thread_name".to_string(),
            cat: "",
            ph: "M",
            ts: 0.0,
            dur: None,
            pid: self.pid,
            tid,
            args: Some(HashMap::from([("name", serde_json::json!(name))])),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn relative_ts(&mut self, timestamp_us: u64) -> f64 {
        let start = *self.start_us.get_or_insert(timestamp_us);
        timestamp_us.saturating_sub(start) as f64
    }

    #[allow(clippy::cast_precision_loss)]
    fn convert(&mut self, event: &Event) -> ChromeTraceEvent {
        let ts = self.relative_ts(event.timestamp_us);
        let name = event.name();

        match &event.kind {
            EventKind::Operation { operation_id, duration_ms } => {
                let dur = *duration_ms as f64 * 1000.0;
                ChromeTraceEvent {
                    name,
                    cat: "operation",
                    ph: "X",
                    // Reported on completion; draw the span ending at arrival
                    ts: (ts - dur).max(0.0),
                    dur: Some(dur),
                    pid: self.pid,
                    tid: TID_OPERATIONS,
                    args: Some(HashMap::from([
                        ("operation_id", serde_json::json!(operation_id)),
                        ("duration_ms", serde_json::json!(duration_ms)),
                    ])),
                }
            }
            EventKind::IterationStarted { phase, ordinal } => ChromeTraceEvent {
                name,
                cat: "iteration",
                ph: "B",
                ts,
                dur: None,
                pid: self.pid,
                tid: TID_ITERATIONS,
                args: Some(HashMap::from([
                    ("phase", serde_json::json!(phase)),
                    ("ordinal", serde_json::json!(ordinal)),
                ])),
            },
            EventKind::IterationFinished { duration_ms, succeeded, .. } => ChromeTraceEvent {
                name,
                cat: "iteration",
                ph: "E",
                ts,
                dur: None,
                pid: self.pid,
                tid: TID_ITERATIONS,
                args: Some(HashMap::from([
                    ("duration_ms", serde_json::json!(duration_ms)),
                    ("succeeded", serde_json::json!(succeeded)),
                ])),
            },
            EventKind::ProfilerCommand { delivered, .. } => ChromeTraceEvent {
                name,
                cat: "profiler",
                ph: "i",
                ts,
                dur: None,
                pid: self.pid,
                tid: TID_PROFILER,
                args: Some(HashMap::from([("delivered", serde_json::json!(delivered))])),
            },
        }
    }
}

impl Default for ChromeTraceRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer<Event> for ChromeTraceRenderer {
    fn header(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(b"{\"displayTimeUnit\":\"ms\",\"traceEvents\":[\n")?;
        for (tid, name) in
            [(TID_ITERATIONS, "iterations"), (TID_OPERATIONS, "operations"), (TID_PROFILER, "profiler")]
        {
            let meta = self.thread_name(tid, name);
            self.write_element(&meta, out)?;
        }
        Ok(())
    }

    fn render(&mut self, value: &Event, out: &mut dyn Write) -> io::Result<()> {
        let element = self.convert(value);
        self.write_element(&element, out)
    }

    fn footer(&mut self, out: &mut dyn Write) -> io::Result<()> {
        out.write_all(b"\n]}\n")
    }
}
