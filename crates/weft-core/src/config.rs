//! Orchestrator configuration.
//!
//! Priority for each setting:
//! 1. `WEFT_*` environment variable (if set)
//! 2. value in the TOML file
//! 3. built-in default (`Default` impl, via `#[serde(default)]`)

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::RetryPolicy;
use crate::routing::RoutingConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config file at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing TOML config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("environment variable {name}={value:?} is not valid")]
    Env { name: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Per-job ceiling on dispatched + running tasks.
    pub max_parallel_tasks: usize,
    /// Tasks one worker executes at the same time.
    pub worker_max_concurrency: usize,
    pub lease_ttl_secs: u64,
    /// A lease whose heartbeat is older than this is recovered even if it
    /// has not expired yet.
    pub stale_after_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Minimum spacing of `task_heartbeat` events per task.
    pub heartbeat_log_interval_secs: u64,
    pub dispatch_timeout_secs: u64,
    /// Wall-clock budget of one run, measured from its start.
    pub job_timeout_secs: u64,
    /// How often a lost CAS race is retried before giving up on a job.
    pub claim_retry_limit: u32,
    /// Recoveries of the same task after which an alert is raised.
    pub stale_alert_threshold: u32,
    pub retry: RetryPolicy,
    pub routing: RoutingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 2,
            worker_max_concurrency: 2,
            lease_ttl_secs: 60,
            stale_after_secs: 300,
            heartbeat_interval_secs: 15,
            heartbeat_log_interval_secs: 30,
            dispatch_timeout_secs: 600,
            job_timeout_secs: 2400,
            claim_retry_limit: 5,
            stale_alert_threshold: 3,
            retry: RetryPolicy::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_log_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_log_interval_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 11] = [
            (self.max_parallel_tasks > 0, "max_parallel_tasks must be at least 1"),
            (self.worker_max_concurrency > 0, "worker_max_concurrency must be at least 1"),
            (self.lease_ttl_secs > 0, "lease_ttl_secs must be positive"),
            (self.heartbeat_interval_secs > 0, "heartbeat_interval_secs must be positive"),
            (self.stale_after_secs > 0, "stale_after_secs must be positive"),
            (self.dispatch_timeout_secs > 0, "dispatch_timeout_secs must be positive"),
            (
                self.heartbeat_interval_secs < self.lease_ttl_secs,
                "heartbeat_interval_secs must be shorter than lease_ttl_secs",
            ),
            (
                self.heartbeat_interval_secs < self.stale_after_secs,
                "heartbeat_interval_secs must be shorter than stale_after_secs",
            ),
            (self.retry.max_attempts > 0, "retry.max_attempts must be at least 1"),
            (self.retry.multiplier >= 1.0, "retry.multiplier must be >= 1.0"),
            (
                !self.routing.default_executor.trim().is_empty(),
                "routing.default_executor must not be empty",
            ),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(ConfigError::Invalid((*msg).to_string())),
            None => Ok(()),
        }
    }

    /// Applies `WEFT_*` overrides read through `lookup`.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        override_from(&lookup, "WEFT_MAX_PARALLEL_TASKS", &mut self.max_parallel_tasks)?;
        override_from(&lookup, "WEFT_WORKER_MAX_CONCURRENCY", &mut self.worker_max_concurrency)?;
        override_from(&lookup, "WEFT_LEASE_TTL_SECS", &mut self.lease_ttl_secs)?;
        override_from(&lookup, "WEFT_STALE_AFTER_SECS", &mut self.stale_after_secs)?;
        override_from(&lookup, "WEFT_DISPATCH_TIMEOUT_SECS", &mut self.dispatch_timeout_secs)?;
        override_from(&lookup, "WEFT_JOB_TIMEOUT_SECS", &mut self.job_timeout_secs)?;
        override_from(&lookup, "WEFT_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        Ok(())
    }

    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides(|name| std::env::var(name).ok())
    }
}

fn override_from<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(());
    };
    *slot = value.trim().parse().map_err(|_| ConfigError::Env {
        name: name.to_string(),
        value: value.clone(),
    })?;
    Ok(())
}

/// Reads and deserializes a TOML file. No semantic validation.
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
