//! Aggregation of samples over the measured phase.
//!
//! Warm-up results are executed but never aggregated. Within a sample, an
//! iteration whose measurement has a zero count is skipped for that sample
//! only; other samples of the same iteration are unaffected.

// Counts become f64 for averaging
#![allow(clippy::cast_precision_loss)]

use log::debug;
use serde::Serialize;

use super::samples::Sample;
use crate::domain::Phase;
use crate::results::BuildInvocationResult;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub name: String,
    pub unit: &'static str,
    /// Measured iterations that contributed a value
    pub iterations: usize,
    /// Sum of occurrence counts over those iterations
    pub occurrences: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    /// Sample standard deviation; zero for a single value
    pub std_dev: f64,
}

impl Statistics {
    /// `None` when there are no values.
    #[must_use]
    pub fn from_values(
        name: &str,
        unit: &'static str,
        values: &[f64],
        occurrences: u64,
    ) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        let std_dev = if values.len() > 1 {
            let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (sum_sq / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        Some(Self {
            name: name.to_string(),
            unit,
            iterations: values.len(),
            occurrences,
            mean,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            median,
            std_dev,
        })
    }
}

/// Computes [`Statistics`] for an ordered set of samples.
#[derive(Debug)]
pub struct SampleAggregator {
    samples: Vec<Sample>,
}

impl SampleAggregator {
    #[must_use]
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Execution time plus every sub-operation present in `results`.
    #[must_use]
    pub fn for_results(results: &[BuildInvocationResult]) -> Self {
        Self::new(Sample::defaults_for(results))
    }

    /// One entry per sample with at least one contributing measured iteration,
    /// in sample order.
    #[must_use]
    pub fn aggregate(&self, results: &[BuildInvocationResult]) -> Vec<Statistics> {
        let measured: Vec<&BuildInvocationResult> =
            results.iter().filter(|r| r.phase == Phase::Measured).collect();

        self.samples
            .iter()
            .filter_map(|sample| {
                let mut values = Vec::with_capacity(measured.len());
                let mut occurrences = 0u64;
                for result in &measured {
                    let m = sample.measure(result);
                    if m.count == 0 {
                        continue;
                    }
                    values.push(m.value);
                    occurrences += u64::from(m.count);
                }
                let stats =
                    Statistics::from_values(sample.name(), sample.unit(), &values, occurrences);
                if stats.is_none() {
                    debug!("Sample '{}' has no measured values", sample.name());
                }
                stats
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Iteration, OperationTotals};
    use std::time::Duration;

    fn result(index: usize, warmups: usize, ms: u64) -> BuildInvocationResult {
        BuildInvocationResult::new(&Iteration::at(index, warmups), Duration::from_millis(ms))
    }

    #[test]
    fn test_warmups_excluded_from_execution_time() {
        let results: Vec<_> = [100, 100, 50, 60, 70]
            .iter()
            .enumerate()
            .map(|(i, ms)| result(i, 2, *ms))
            .collect();

        let stats = SampleAggregator::new(vec![Sample::execution_time()]).aggregate(&results);
        assert_eq!(stats.len(), 1);
        let time = &stats[0];
        assert_eq!(time.iterations, 3);
        assert!((time.mean - 60.0).abs() < 1e-9);
        assert!((time.min - 50.0).abs() < 1e-9);
        assert!((time.max - 70.0).abs() < 1e-9);
        assert!((time.median - 60.0).abs() < 1e-9);
        assert!((time.std_dev - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_operation_skipped_for_that_sample_only() {
        let mut results: Vec<_> = (0..3).map(|i| result(i, 0, 10 * (i as u64 + 1))).collect();
        results[0]
            .operations
            .insert("compile".to_string(), OperationTotals::new(Duration::from_millis(4), 2));
        results[2]
            .operations
            .insert("compile".to_string(), OperationTotals::new(Duration::from_millis(8), 1));

        let stats = SampleAggregator::for_results(&results).aggregate(&results);
        let time = stats.iter().find(|s| s.name == "execution time").unwrap();
        let compile = stats.iter().find(|s| s.name == "compile").unwrap();

        assert_eq!(time.iterations, 3);
        assert!((time.mean - 20.0).abs() < 1e-9);
        assert_eq!(compile.iterations, 2);
        assert_eq!(compile.occurrences, 3);
        assert!((compile.mean - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_even_median_and_empty_sample() {
        let stats = Statistics::from_values("x", "ms", &[4.0, 1.0, 3.0, 2.0], 4).unwrap();
        assert!((stats.median - 2.5).abs() < 1e-9);
        assert!(Statistics::from_values("x", "ms", &[], 0).is_none());

        // Only warm-ups: nothing to aggregate
        let warmups = vec![result(0, 1, 5)];
        assert!(SampleAggregator::for_results(&warmups).aggregate(&warmups).is_empty());
    }
}
