//! OrchestratorBuilder - ワイヤリングと起動時検証
//!
//! # Fail-fast 設計
//! - 設定は `build()` で検証する（ゼロの上限などは起動時に落とす）
//! - `expect_executors()` で実際に用意した executor を宣言すると、
//!   ルーティング表がそれ以外を指していないかを `build()` でチェックする
//! - decomposer / executor が無ければ BuildError

use std::sync::Arc;

use crate::app::coordinator::Coordinator;
use crate::app::orchestrator::Orchestrator;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::domain::{Decider, DefaultDecider};
use crate::impls::LogNotifier;
use crate::ports::{Clock, Decomposer, Executor, IdGenerator, JobStore, Notifier, SystemClock, UlidGenerator};
use crate::routing::CapabilityRegistry;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("missing collaborator: {0}")]
    Missing(&'static str),

    #[error("routing points at executors that were not provided: {0:?}")]
    UnknownExecutors(Vec<String>),
}

/// ```ignore
/// let orchestrator = OrchestratorBuilder::new(Arc::new(store))
///     .config(config)
///     .decomposer(Arc::new(decomposer))
///     .executor(Arc::new(executor))
///     .expect_executors(&["general", "coder"])
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    store: Arc<dyn JobStore>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    decider: Option<Arc<dyn Decider>>,
    notifier: Option<Arc<dyn Notifier>>,
    decomposer: Option<Arc<dyn Decomposer>>,
    executor: Option<Arc<dyn Executor>>,
    config: OrchestratorConfig,
    expected_executors: Option<Vec<String>>,
}

impl OrchestratorBuilder {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            clock: None,
            ids: None,
            decider: None,
            notifier: None,
            decomposer: None,
            executor: None,
            config: OrchestratorConfig::default(),
            expected_executors: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to the system clock. Also drives ID timestamps unless
    /// `ids()` is set.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Defaults to `DefaultDecider` with the configured retry policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Defaults to `LogNotifier`.
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = Some(decomposer);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn expect_executors(mut self, executors: &[&str]) -> Self {
        self.expected_executors = Some(executors.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected_executors {
            let registry = CapabilityRegistry::from_config(&self.config.routing);
            let unknown: Vec<String> = registry
                .executors()
                .into_iter()
                .map(|e| e.as_str().to_string())
                .filter(|e| !expected.contains(e))
                .collect();
            if !unknown.is_empty() {
                return Err(BuildError::UnknownExecutors(unknown));
            }
        }
        let decomposer = self.decomposer.ok_or(BuildError::Missing("decomposer"))?;
        let executor = self.executor.ok_or(BuildError::Missing("executor"))?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(DefaultDecider::new(self.config.retry.clone())));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let coordinator = Coordinator::new(self.store, clock, ids, decider, notifier, self.config);
        Ok(Orchestrator::new(Arc::new(coordinator), decomposer, executor))
    }
}
