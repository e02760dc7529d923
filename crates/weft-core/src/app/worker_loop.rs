//! WorkerLoop - recover → plan → claim → execute → release
//!
//! `Worker::tick` は 1 サイクルだけ回します。`WorkerGroup` はそれを
//! shutdown まで繰り返すワーカーを複数起動します。
//!
//! 実行中のタスクは `JoinSet` の中で並行に走り、それぞれが
//! executor の future と heartbeat の interval を `tokio::select!` で競わせます。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::app::coordinator::{Claim, Coordinator, PlanningClaim};
use crate::domain::{Decision, ErrorClass, ExecutionOutcome, OrchestratorError, WorkerId};
use crate::ports::{Decomposer, Executor};

/// What one `tick` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub recovered: usize,
    pub timed_out: usize,
    pub planned: usize,
    pub executed: usize,
    /// Outcomes whose lease was gone by the time they arrived.
    pub discarded: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Clone)]
pub struct Worker {
    id: WorkerId,
    coordinator: Arc<Coordinator>,
    decomposer: Arc<dyn Decomposer>,
    executor: Arc<dyn Executor>,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        coordinator: Arc<Coordinator>,
        decomposer: Arc<dyn Decomposer>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            id,
            coordinator,
            decomposer,
            executor,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub async fn tick(&self) -> Result<TickReport, OrchestratorError> {
        let config = self.coordinator.config();
        let slots = config.worker_max_concurrency;
        let mut report = TickReport {
            recovered: self.coordinator.recover_stale().await?,
            timed_out: self.coordinator.enforce_job_timeouts().await?,
            ..TickReport::default()
        };

        for claim in self.coordinator.claim_planning(&self.id, slots).await? {
            if self.plan(claim).await {
                report.planned += 1;
            }
        }

        let claims = self.coordinator.claim(&self.id, slots).await?;
        if claims.is_empty() {
            return Ok(report);
        }
        debug!(worker = %self.id, claimed = claims.len(), "executing claims");

        let mut running = JoinSet::new();
        for claim in claims {
            running.spawn(execute_claim(
                Arc::clone(&self.coordinator),
                Arc::clone(&self.executor),
                claim,
            ));
        }
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(_)) => report.executed += 1,
                Ok(Err(OrchestratorError::LeaseNotHeld(_) | OrchestratorError::LeaseExpired(_))) => {
                    report.discarded += 1;
                }
                Ok(Err(e)) => warn!(worker = %self.id, error = %e, "release failed"),
                Err(e) => error!(worker = %self.id, error = %e, "execution task panicked"),
            }
        }
        Ok(report)
    }

    async fn plan(&self, claim: PlanningClaim) -> bool {
        let result = self.decomposer.decompose(&claim.goal, &claim.context).await;
        match self.coordinator.complete_planning(&claim.token, result).await {
            Ok(status) => {
                debug!(job_id = %claim.token.job_id, %status, "planning finished");
                true
            }
            Err(e) => {
                warn!(job_id = %claim.token.job_id, error = %e, "planning result rejected");
                false
            }
        }
    }
}

/// Runs one claim to completion and releases it.
///
/// A heartbeat that finds the lease gone stops the execution early; the
/// work now belongs to someone else.
async fn execute_claim(
    coordinator: Arc<Coordinator>,
    executor: Arc<dyn Executor>,
    claim: Claim,
) -> Result<Option<Decision>, OrchestratorError> {
    let config = coordinator.config();
    let dispatch_timeout = config.dispatch_timeout();
    let beat_every = config.heartbeat_interval();
    let mut token = coordinator.heartbeat(&claim.token).await?;

    let execution = tokio::time::timeout(
        dispatch_timeout,
        executor.execute(&claim.request, dispatch_timeout),
    );
    tokio::pin!(execution);
    let mut beats = tokio::time::interval_at(tokio::time::Instant::now() + beat_every, beat_every);

    let outcome = loop {
        tokio::select! {
            finished = &mut execution => {
                break finished.unwrap_or_else(|_| {
                    ExecutionOutcome::failure(
                        ErrorClass::Timeout,
                        format!("dispatch exceeded {}s", dispatch_timeout.as_secs()),
                    )
                });
            }
            _ = beats.tick() => {
                token = coordinator.heartbeat(&token).await?;
            }
        }
    };
    debug!(task_id = %claim.request.task.id, success = outcome.is_success(), "execution finished");
    coordinator.release(&token, outcome).await
}

/// Worker group handle.
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
/// - 実行中のタスクは止めない（新しい claim を取らなくなるだけ）
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawns one loop per worker; each sleeps `idle` between idle ticks.
    pub fn spawn(workers: Vec<Worker>, idle: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = workers
            .into_iter()
            .map(|worker| {
                let mut rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    worker_loop(worker, idle, &mut rx).await;
                })
            })
            .collect();
        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker loop panicked");
            }
        }
    }
}

async fn worker_loop(worker: Worker, idle: Duration, shutdown_rx: &mut watch::Receiver<bool>) {
    info!(worker = %worker.id(), "worker started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let busy = match worker.tick().await {
            Ok(report) => !report.is_idle(),
            Err(e) => {
                warn!(worker = %worker.id(), error = %e, "tick failed");
                false
            }
        };
        if busy {
            continue;
        }
        tokio::select! {
            _ = shutdown_rx.changed() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
    info!(worker = %worker.id(), "worker stopped");
}
