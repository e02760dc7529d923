//! `weft.toml`: store location, plan directory, orchestrator tuning and
//! the shell command behind each executor.
//!
//! ```toml
//! database = "var/weft.db"
//! plans_dir = "plans"
//!
//! [orchestrator]
//! max_parallel_tasks = 4
//!
//! [[orchestrator.routing.rules]]
//! capability = "code"
//! executor = "coder"
//!
//! [executors.general]
//! command = "./agents/general.sh"
//!
//! [executors.coder]
//! command = "./agents/coder.sh"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use weft_core::OrchestratorConfig;
use weft_core::config::load_toml;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExecutorCommand {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub database: PathBuf,
    pub plans_dir: PathBuf,
    pub orchestrator: OrchestratorConfig,
    pub executors: BTreeMap<String, ExecutorCommand>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("weft.db"),
            plans_dir: PathBuf::from("plans"),
            orchestrator: OrchestratorConfig::default(),
            executors: BTreeMap::new(),
        }
    }
}

impl CliConfig {
    /// Loads `path`; a missing file at the default location means defaults.
    /// `WEFT_*` overrides are applied last.
    pub fn load(path: &Path, explicit: bool) -> Result<Self> {
        let mut config = if path.exists() || explicit {
            load_toml::<CliConfig>(path)
                .with_context(|| format!("loading config from {}", path.display()))?
        } else {
            CliConfig::default()
        };
        config
            .orchestrator
            .apply_process_env()
            .context("applying WEFT_* overrides")?;
        Ok(config)
    }

    pub fn executor_names(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_executor_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            database = "state/weft.db"

            [orchestrator]
            max_parallel_tasks = 3

            [executors.general]
            command = "cat"
            "#
        )
        .unwrap();

        let config = CliConfig::load(file.path(), true).unwrap();
        assert_eq!(config.database, PathBuf::from("state/weft.db"));
        assert_eq!(config.plans_dir, PathBuf::from("plans"));
        assert_eq!(config.orchestrator.max_parallel_tasks, 3);
        assert_eq!(config.executor_names(), vec!["general"]);
    }

    #[test]
    fn missing_default_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load(&dir.path().join("weft.toml"), false).unwrap();
        assert_eq!(config.database, PathBuf::from("weft.db"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::load(&dir.path().join("nope.toml"), true).is_err());
    }
}
