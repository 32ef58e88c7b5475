//! Scenario configuration.
//!
//! A scenario file is a JSON array; only `name` is required:
//!
//! ```json
//! [
//!   {
//!     "name": "assemble",
//!     "command": ["make", "-j8"],
//!     "warmups": 2,
//!     "iterations": 5,
//!     "profiler": "static-agent",
//!     "tracked_operations": [{ "id": 1, "name": "compile" }]
//!   }
//! ]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::mutator::ClearDirectory;
use crate::domain::{ConfigurationError, OperationId, Phase};
use crate::profiling::BackendKind;

const DEFAULT_WARMUPS: usize = 2;
const DEFAULT_ITERATIONS: usize = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Which phases a dynamic profiler records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingScope {
    #[default]
    Measured,
    All,
}

impl RecordingScope {
    #[must_use]
    pub fn includes(self, phase: Phase) -> bool {
        match self {
            RecordingScope::All => true,
            RecordingScope::Measured => phase == Phase::Measured,
        }
    }
}

/// What to do with the rest of a scenario after an iteration fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Skip the remaining iterations; the run moves on to the next scenario
    #[default]
    AbortScenario,
    Continue,
}

/// Display name for an operation id reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedOperation {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,
    /// Program followed by its arguments
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_warmups")]
    pub warmups: usize,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    #[serde(default)]
    pub profiler: BackendKind,
    #[serde(default)]
    pub record: RecordingScope,
    /// Capture a snapshot after each recorded iteration
    #[serde(default)]
    pub snapshot: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub tracked_operations: Vec<TrackedOperation>,
    #[serde(default)]
    pub clear_directories: Vec<ClearDirectory>,
}

fn default_warmups() -> usize {
    DEFAULT_WARMUPS
}

fn default_iterations() -> usize {
    DEFAULT_ITERATIONS
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Scenario {
    /// A scenario with default counts, no profiler and no command.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            warmups: DEFAULT_WARMUPS,
            iterations: DEFAULT_ITERATIONS,
            profiler: BackendKind::None,
            record: RecordingScope::default(),
            snapshot: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            failure_policy: FailurePolicy::default(),
            tracked_operations: Vec::new(),
            clear_directories: Vec::new(),
        }
    }

    /// Load every scenario from a JSON file.
    ///
    /// # Errors
    /// Returns [`ConfigurationError::ScenarioFile`] if the file cannot be read
    /// or parsed, is empty, or repeats a scenario name.
    pub fn load_file(path: &Path) -> Result<Vec<Self>, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::ScenarioFile {
            path: path.to_path_buf(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let scenarios: Vec<Self> = serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;

        if scenarios.is_empty() {
            return Err(invalid("no scenarios defined".to_string()));
        }
        let mut names = HashSet::new();
        let mut stems = HashSet::new();
        for scenario in &scenarios {
            if !names.insert(scenario.name.as_str()) {
                return Err(invalid(format!("scenario '{}' is defined twice", scenario.name)));
            }
            let stem = scenario.file_stem();
            if !stems.insert(stem.clone()) {
                return Err(invalid(format!(
                    "scenario '{}' would overwrite the output of another scenario ('{stem}')",
                    scenario.name
                )));
            }
        }
        Ok(scenarios)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn total_iterations(&self) -> usize {
        self.warmups + self.iterations
    }

    #[must_use]
    pub fn operation_names(&self) -> BTreeMap<OperationId, String> {
        self.tracked_operations
            .iter()
            .map(|op| (OperationId(op.id), op.name.clone()))
            .collect()
    }

    /// Name safe to use in artifact file names.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        if stem.is_empty() {
            "scenario".to_string()
        } else {
            stem
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_only_name_required() {
        let scenarios: Vec<Scenario> = serde_json::from_str(r#"[{"name": "clean build"}]"#).unwrap();
        assert_eq!(scenarios[0], Scenario::new("clean build"));
        assert_eq!(scenarios[0].file_stem(), "clean-build");
        assert!(!RecordingScope::Measured.includes(Phase::Warmup));
        assert!(RecordingScope::All.includes(Phase::Warmup));
    }

    #[test]
    fn test_load_file_rejects_duplicates_and_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "a"}}, {{"name": "a"}}]"#).unwrap();
        let err = Scenario::load_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("defined twice"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "a", "iteratons": 3}}]"#).unwrap();
        assert!(Scenario::load_file(file.path()).is_err());
    }

    #[test]
    fn test_load_file_rejects_colliding_output_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"name": "clean build"}}, {{"name": "clean-build"}}]"#).unwrap();
        let err = Scenario::load_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("'clean-build'"), "{err}");
    }

    #[test]
    fn test_full_scenario() {
        let json = r#"[{
            "name": "incremental",
            "command": ["make"],
            "warmups": 0,
            "iterations": 3,
            "profiler": "dynamic",
            "record": "all",
            "snapshot": true,
            "failure_policy": "continue",
            "tracked_operations": [{"id": 7, "name": "link"}]
        }]"#;
        let scenario = &serde_json::from_str::<Vec<Scenario>>(json).unwrap()[0];
        assert_eq!(scenario.profiler, BackendKind::Dynamic);
        assert_eq!(scenario.failure_policy, FailurePolicy::Continue);
        assert_eq!(scenario.total_iterations(), 3);
        assert_eq!(scenario.operation_names()[&OperationId(7)], "link");
    }
}
