//! One JSON object per line.
//!
//! ```text
//! {"format":"buildscope-events","version":1,"scenario":"assemble"}
//! {"timestamp_us":1712..., "kind":"iteration_started","phase":"measured","ordinal":1}
//! ...
//! {"end":true,"records":42}
//! ```

use std::io::{self, Write};

use serde_json::json;

use crate::sink::{Event, Renderer};

const FORMAT_VERSION: u32 = 1;

pub struct JsonLinesRenderer {
    scenario: String,
    records: usize,
}

impl JsonLinesRenderer {
    #[must_use]
    pub fn new(scenario: impl Into<String>) -> Self {
        Self { scenario: scenario.into(), records: 0 }
    }
}

impl Renderer<Event> for JsonLinesRenderer {
    fn header(&mut self, out: &mut dyn Write) -> io::Result<()> {
        let header = json!({
            "format": "buildscope-events",
            "version": FORMAT_VERSION,
            "scenario": self.scenario,
        });
        serde_json::to_writer(&mut *out, &header)?;
        out.write_all(b"\n")
    }

    fn render(&mut self, value: &Event, out: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer(&mut *out, value)?;
        out.write_all(b"\n")?;
        self.records += 1;
        Ok(())
    }

    fn footer(&mut self, out: &mut dyn Write) -> io::Result<()> {
        serde_json::to_writer(&mut *out, &json!({ "end": true, "records": self.records }))?;
        out.write_all(b"\n")
    }
}
