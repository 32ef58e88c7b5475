//! Per-iteration totals of operation events.

use std::collections::BTreeMap;
use std::time::Duration;

use buildscope_common::OperationEvent;

use crate::domain::{OperationId, OperationTotals};

#[derive(Debug, Default)]
pub struct OperationTally {
    totals: BTreeMap<OperationId, OperationTotals>,
}

impl OperationTally {
    pub fn record(&mut self, event: &OperationEvent) {
        // Negative durations never make it past frame decoding
        let millis = u64::try_from(event.duration_ms).unwrap_or(0);
        self.totals
            .entry(OperationId(event.operation_id))
            .or_default()
            .add(Duration::from_millis(millis));
    }

    /// Hand over everything recorded so far and start from zero.
    pub fn drain(&mut self) -> BTreeMap<OperationId, OperationTotals> {
        std::mem::take(&mut self.totals)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_resets() {
        let mut tally = OperationTally::default();
        tally.record(&OperationEvent::new(1, 10));
        tally.record(&OperationEvent::new(1, 5));
        tally.record(&OperationEvent::new(2, 1));

        let drained = tally.drain();
        assert_eq!(drained[&OperationId(1)], OperationTotals::new(Duration::from_millis(15), 2));
        assert_eq!(drained[&OperationId(2)].count, 1);
        assert!(tally.is_empty());
    }
}
