//! Analysis of iteration results
//!
//! Turns raw per-iteration results into named samples and aggregates them
//! over the measured phase.

pub mod samples;
pub mod statistics;

pub use samples::{Measurement, Sample};
pub use statistics::{SampleAggregator, Statistics};
