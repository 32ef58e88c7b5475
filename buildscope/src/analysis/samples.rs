//! Named metrics extracted from iteration results.

use std::collections::BTreeSet;
use std::fmt;

use crate::results::BuildInvocationResult;

/// One iteration's value for a sample.
///
/// `count` is how often the metric occurred in that iteration; zero means
/// the iteration has nothing to contribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub value: f64,
    pub count: u32,
}

impl Measurement {
    pub const ABSENT: Self = Self { value: 0.0, count: 0 };
}

type Extractor = Box<dyn Fn(&BuildInvocationResult) -> Measurement + Send + Sync>;

pub struct Sample {
    name: String,
    unit: &'static str,
    extractor: Extractor,
}

impl Sample {
    pub fn new(
        name: impl Into<String>,
        unit: &'static str,
        extractor: impl Fn(&BuildInvocationResult) -> Measurement + Send + Sync + 'static,
    ) -> Self {
        Self { name: name.into(), unit, extractor: Box::new(extractor) }
    }

    /// Wall-clock duration of the whole build.
    #[must_use]
    pub fn execution_time() -> Self {
        Self::new("execution time", "ms", |result| Measurement {
            value: result.execution_time.as_secs_f64() * 1000.0,
            count: 1,
        })
    }

    /// Total time spent in the named sub-operation.
    #[must_use]
    pub fn operation(name: impl Into<String>) -> Self {
        let name = name.into();
        let key = name.clone();
        Self::new(name, "ms", move |result| {
            result.operations.get(&key).map_or(Measurement::ABSENT, |totals| Measurement {
                value: totals.total.as_secs_f64() * 1000.0,
                count: totals.count,
            })
        })
    }

    /// Execution time plus one sample per sub-operation seen in `results`.
    #[must_use]
    pub fn defaults_for(results: &[BuildInvocationResult]) -> Vec<Self> {
        let names: BTreeSet<&String> = results.iter().flat_map(|r| r.operations.keys()).collect();
        std::iter::once(Self::execution_time())
            .chain(names.into_iter().map(|name| Self::operation(name.clone())))
            .collect()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn unit(&self) -> &'static str {
        self.unit
    }

    #[must_use]
    pub fn measure(&self, result: &BuildInvocationResult) -> Measurement {
        (self.extractor)(result)
    }
}

impl fmt::Debug for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sample").field("name", &self.name).field("unit", &self.unit).finish()
    }
}
