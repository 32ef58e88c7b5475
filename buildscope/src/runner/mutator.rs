//! Changes applied to the build environment around iterations.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use super::scenario::Scenario;
use crate::domain::Iteration;

/// Hook points around a scenario's iterations. All default to doing nothing.
pub trait BuildMutator: Send + Sync {
    fn name(&self) -> String;

    /// # Errors
    /// A failure aborts the scenario before its first iteration.
    fn before_scenario(&self, _scenario: &Scenario) -> Result<()> {
        Ok(())
    }

    /// # Errors
    /// A failure fails the iteration.
    fn before_build(&self, _iteration: &Iteration) -> Result<()> {
        Ok(())
    }

    /// # Errors
    /// A failure is logged.
    fn after_build(&self, _iteration: &Iteration) -> Result<()> {
        Ok(())
    }

    /// # Errors
    /// A failure is logged.
    fn after_scenario(&self, _scenario: &Scenario) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationSchedule {
    /// Once, before the first iteration
    #[default]
    Scenario,
    /// Before every iteration
    Build,
}

/// Configuration of a [`ClearDirectoryMutator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearDirectory {
    pub target: PathBuf,
    #[serde(default)]
    pub schedule: MutationSchedule,
    /// Entry names directly under `target` to leave in place
    #[serde(default)]
    pub keep: Vec<String>,
}

/// Empties a directory (build output, caches) so iterations start cold.
#[derive(Debug, Clone)]
pub struct ClearDirectoryMutator {
    config: ClearDirectory,
}

impl ClearDirectoryMutator {
    #[must_use]
    pub fn new(config: ClearDirectory) -> Self {
        Self { config }
    }

    fn clear(&self) -> Result<()> {
        let target = &self.config.target;
        info!("Clearing directory {}", target.display());
        let entries = match fs::read_dir(target) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", target.display()))
            }
        };

        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to list {}", target.display()))?;
            let name = entry.file_name();
            if self.config.keep.iter().any(|k| name.to_str() == Some(k.as_str())) {
                continue;
            }
            remove(&entry.path())?;
        }
        Ok(())
    }
}

fn remove(path: &Path) -> Result<()> {
    let result = if path.is_dir() { fs::remove_dir_all(path) } else { fs::remove_file(path) };
    result.with_context(|| format!("Failed to delete {}", path.display()))
}

impl BuildMutator for ClearDirectoryMutator {
    fn name(&self) -> String {
        format!("clear-directory({})", self.config.target.display())
    }

    fn before_scenario(&self, _scenario: &Scenario) -> Result<()> {
        if self.config.schedule == MutationSchedule::Scenario {
            self.clear()?;
        }
        Ok(())
    }

    fn before_build(&self, _iteration: &Iteration) -> Result<()> {
        if self.config.schedule == MutationSchedule::Build {
            self.clear()?;
        }
        Ok(())
    }
}
