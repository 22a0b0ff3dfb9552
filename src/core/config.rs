//! Engine configuration.
//!
//! A config is assembled once at startup, from defaults, an optional TOML
//! file and the environment, and then passed to the engine by value. Nothing
//! in the engine reads the environment on its own.
//!
//! ```toml
//! cores = 8
//! chunk_size = 1
//! force_sequential = false
//! task_name = "Median filter"
//! ```

use crate::core::error::{StackError, StackResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Overrides the number of worker cores.
pub const ENV_CORES: &str = "STACKPAR_CORES";

/// Overrides the chunk size.
pub const ENV_CHUNKSIZE: &str = "STACKPAR_CHUNKSIZE";

/// When set to anything but `0`/`false`, every call runs on the calling thread.
/// Meant for debuggers that cannot follow work onto pool threads.
pub const ENV_SYNC: &str = "STACKPAR_SYNC";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker count; `None` uses every logical core.
    pub cores: Option<usize>,
    /// Indices per unit of work; `None` uses the default of 1.
    pub chunk_size: Option<usize>,
    /// Always run sequentially.
    pub force_sequential: bool,
    /// Name used in progress messages.
    pub task_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cores: None,
            chunk_size: None,
            force_sequential: false,
            task_name: "Progress".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker cores.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = Some(cores);
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Force sequential execution.
    pub fn with_force_sequential(mut self, force: bool) -> Self {
        self.force_sequential = force;
        self
    }

    /// Set the task name shown in progress messages.
    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = name.into();
        self
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> StackResult<Self> {
        toml::from_str(text).map_err(|e| StackError::Config(e.to_string()))
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> StackResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> StackResult<String> {
        toml::to_string(self).map_err(|e| StackError::Config(e.to_string()))
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> StackResult<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn with_overrides<F>(mut self, lookup: F) -> StackResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CORES) {
            self.cores = Some(parse_count(ENV_CORES, &value)?);
        }
        if let Some(value) = lookup(ENV_CHUNKSIZE) {
            self.chunk_size = Some(parse_count(ENV_CHUNKSIZE, &value)?);
        }
        if let Some(value) = lookup(ENV_SYNC) {
            self.force_sequential = !matches!(value.trim(), "" | "0" | "false");
        }
        Ok(self)
    }
}

fn parse_count(key: &str, value: &str) -> StackResult<usize> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| StackError::Config(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_cores(4)
            .with_chunk_size(2)
            .with_force_sequential(true)
            .with_task_name("Median filter");

        assert_eq!(config.cores, Some(4));
        assert_eq!(config.chunk_size, Some(2));
        assert!(config.force_sequential);
        assert_eq!(config.task_name, "Median filter");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str("cores = 3\n").unwrap();
        assert_eq!(config.cores, Some(3));
        assert_eq!(config.chunk_size, None);
        assert_eq!(config.task_name, "Progress");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("cores = \"many\""),
            Err(StackError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "chunk_size = 4\nforce_sequential = true").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.chunk_size, Some(4));
        assert!(config.force_sequential);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::new().with_cores(2).with_task_name("Flat field");
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [(ENV_CORES, "6"), (ENV_SYNC, "1")].into_iter().collect();
        let config = EngineConfig::new()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cores, Some(6));
        assert!(config.force_sequential);

        let config = EngineConfig::new()
            .with_force_sequential(true)
            .with_overrides(|key| (key == ENV_SYNC).then(|| "0".to_string()))
            .unwrap();
        assert!(!config.force_sequential);

        assert!(EngineConfig::new()
            .with_overrides(|key| (key == ENV_CHUNKSIZE).then(|| "x".to_string()))
            .is_err());
    }
}
