//! Coordinator - lease ベースのワーカー協調
//!
//! すべての操作は「job を読む → `Transition` で変更 → version に対する CAS」
//! という同じ形をしています。CAS に負けたら読み直して最初からやり直し、
//! `claim_retry_limit` 回負け続けたら `LeaseConflict` を返します。
//!
//! # 操作
//! - `claim` / `dispatch`: eligible なタスクに lease を付けて返す
//! - `heartbeat`: lease の延長（イベントは間引く）
//! - `release`: 結果を classifier 経由で状態機械に流す
//! - `recover_stale`: 止まったワーカーの lease を回収する
//! - `claim_planning` / `complete_planning`: 分解（decomposition）の lease
//! - `enforce_job_timeouts`: run ごとの時間予算

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::domain::{
    Decider, Decision, EventDraft, EventKind, ExecutionOutcome, JobId, JobRecord, JobStatus, Lease,
    LeaseToken, LeaseUnit, OrchestratorError, PlanningError, StoreError, TaskId, TaskSpec,
    TaskStatus, WorkerId,
};
use crate::graph::ExecutionGraph;
use crate::machine::Transition;
use crate::ports::{
    Clock, Commit, DecompositionError, ExecutionRequest, IdGenerator, JobStore, Notification,
    Notifier, PlanningContext,
};
use crate::routing::CapabilityRegistry;
use crate::scheduler::Scheduler;

/// One leased task, ready to hand to an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub token: LeaseToken,
    pub request: ExecutionRequest,
}

/// One leased decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningClaim {
    pub token: LeaseToken,
    pub goal: String,
    pub context: PlanningContext,
}

/// What `release` did with an outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Released {
    Applied(Option<Decision>),
    Discarded { expired: bool },
}

pub struct Coordinator {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    decider: Arc<dyn Decider>,
    notifier: Arc<dyn Notifier>,
    registry: CapabilityRegistry,
    scheduler: Scheduler,
    config: OrchestratorConfig,
}

fn secs(n: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(i64::try_from(n).unwrap_or(i64::MAX))
        .unwrap_or(chrono::Duration::MAX)
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        decider: Arc<dyn Decider>,
        notifier: Arc<dyn Notifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry: CapabilityRegistry::from_config(&config.routing),
            scheduler: Scheduler::new(config.max_parallel_tasks),
            store,
            clock,
            ids,
            decider,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub(crate) fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn ids(&self) -> &dyn IdGenerator {
        self.ids.as_ref()
    }

    /// Inserts a brand-new job and notifies about its events.
    pub(crate) async fn insert(
        &self,
        job: &JobRecord,
        events: &[EventDraft],
    ) -> Result<(), OrchestratorError> {
        let commit = self.store.insert_job(job, events).await?;
        self.notify(&commit).await;
        Ok(())
    }

    /// Load, change, compare-and-swap; retried when another writer wins.
    ///
    /// Nothing is written when `change` fails or leaves the job untouched.
    pub(crate) async fn mutate<T, F>(&self, job_id: JobId, mut change: F) -> Result<T, OrchestratorError>
    where
        F: FnMut(&mut Transition<'_>) -> Result<T, OrchestratorError>,
    {
        let mut conflicts = 0;
        loop {
            let original = self.store.load_job(job_id).await?;
            let mut job = original.clone();
            let now = self.clock.now();
            let mut tx = Transition::new(&mut job, now);
            let value = change(&mut tx)?;
            let events = tx.into_events();
            if events.is_empty() && job == original {
                return Ok(value);
            }
            match self
                .store
                .compare_and_swap(&job, original.version, &events)
                .await
            {
                Ok(commit) => {
                    self.notify(&commit).await;
                    return Ok(value);
                }
                Err(StoreError::VersionConflict { expected, actual, .. }) => {
                    conflicts += 1;
                    debug!(%job_id, expected, actual, conflicts, "lost CAS race, retrying");
                    if conflicts > self.config.claim_retry_limit {
                        return Err(OrchestratorError::LeaseConflict(job_id));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn notify(&self, commit: &Commit) {
        for event in &commit.events {
            let Some(notification) = Notification::from_event(event) else {
                continue;
            };
            if let Err(e) = self.notifier.notify(&notification).await {
                // 通知の失敗でオーケストレーションは止めない
                warn!(job_id = %event.job_id, kind = %event.kind, error = %e, "notifier failed");
            }
        }
    }

    /// Leases up to `n` eligible tasks across all jobs.
    ///
    /// Jobs are visited oldest first, tasks in declared order. A job that keeps
    /// losing CAS races is skipped for this round.
    pub async fn claim(&self, worker: &WorkerId, n: usize) -> Result<Vec<Claim>, OrchestratorError> {
        let mut claims = Vec::new();
        for job in self.store.list_jobs(false).await? {
            if claims.len() >= n {
                break;
            }
            if !job.status.is_executable() || !job.audit.permits_dispatch() {
                continue;
            }
            match self.claim_in_job(job.id, worker, n - claims.len()).await {
                Ok(got) => claims.extend(got),
                Err(OrchestratorError::LeaseConflict(job_id)) => {
                    warn!(%job_id, worker = %worker, "claim gave up after repeated conflicts");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(claims)
    }

    /// Leases up to `n` eligible tasks of one job.
    ///
    /// Fails with `AuditGateViolation` unless the latest audit decision is
    /// `approve`.
    pub async fn dispatch(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        n: usize,
    ) -> Result<Vec<Claim>, OrchestratorError> {
        let job = self.store.load_job(job_id).await?;
        if !job.audit.permits_dispatch() {
            return Err(OrchestratorError::AuditGateViolation {
                job_id,
                decision: job.audit.latest.label().to_string(),
            });
        }
        self.claim_in_job(job_id, worker, n).await
    }

    async fn claim_in_job(
        &self,
        job_id: JobId,
        worker: &WorkerId,
        n: usize,
    ) -> Result<Vec<Claim>, OrchestratorError> {
        self.mutate(job_id, |tx| {
            // CAS の内側でもう一度ゲートを確認する
            if !tx.job().audit.permits_dispatch() {
                return Err(OrchestratorError::AuditGateViolation {
                    job_id,
                    decision: tx.job().audit.latest.label().to_string(),
                });
            }
            if !tx.job().status.is_executable() {
                return Ok(Vec::new());
            }
            let graph = Scheduler::graph_for(tx.job())?;
            let eligible: Vec<TaskId> = self
                .scheduler
                .eligible(tx.job(), &graph, tx.now())
                .into_iter()
                .take(n)
                .collect();
            if eligible.is_empty() {
                return Ok(Vec::new());
            }
            if tx.job().status == JobStatus::Approved {
                tx.start_run(self.ids.generate_run_id(), EventKind::RunStarted)?;
            }

            let mut claims = Vec::with_capacity(eligible.len());
            for task_id in eligible {
                claims.push(self.lease_task(tx, &graph, &task_id, worker)?);
            }
            Ok(claims)
        })
        .await
    }

    fn lease_task(
        &self,
        tx: &mut Transition<'_>,
        graph: &ExecutionGraph,
        task_id: &TaskId,
        worker: &WorkerId,
    ) -> Result<Claim, OrchestratorError> {
        let now = tx.now();
        let job_id = tx.job().id;
        let spec = tx
            .job()
            .task(task_id)
            .map(|t| t.spec.clone())
            .ok_or_else(|| OrchestratorError::TaskNotFound {
                job_id,
                task_id: task_id.clone(),
            })?;
        let executor = self.registry.resolve(&spec.capability);
        let lease = Lease {
            id: self.ids.generate_lease_id(),
            job_id,
            run_id: tx.job().current_run,
            unit: LeaseUnit::Task(task_id.clone()),
            worker: worker.clone(),
            acquired_at: now,
            expires_at: now + secs(self.config.lease_ttl_secs),
            heartbeat_at: now,
            heartbeat_logged_at: now,
        };

        let attempt = tx.job().task(task_id).map_or(0, |t| t.attempts) + 1;
        tx.move_task(
            task_id,
            TaskStatus::Dispatched,
            EventKind::TaskDispatched,
            json!({
                "worker": worker,
                "lease_id": lease.id,
                "executor": executor,
                "attempt": attempt,
            }),
        )?;
        let human_inputs = match tx.job_mut().task_mut(task_id) {
            Some(task) => {
                task.attempts = attempt;
                task.executor = Some(executor.clone());
                task.not_before = None;
                task.human_inputs.clone()
            }
            None => Vec::new(),
        };

        let upstream_outputs: BTreeMap<TaskId, _> = graph
            .parents_of(task_id)
            .into_iter()
            .filter_map(|parent| {
                tx.job()
                    .task(&parent)
                    .map(|t| (parent.clone(), t.outputs.clone()))
            })
            .collect();
        let request = ExecutionRequest {
            job_id,
            run_id: tx.job().current_run,
            goal: tx.job().goal.clone(),
            project: tx.job().project.clone(),
            task: spec,
            executor,
            attempt,
            upstream_outputs,
            human_inputs,
        };
        let token = LeaseToken::from(&lease);
        tx.job_mut().leases.push(lease);
        Ok(Claim { token, request })
    }

    /// Extends a live lease. The first beat moves the task to `running`.
    pub async fn heartbeat(&self, token: &LeaseToken) -> Result<LeaseToken, OrchestratorError> {
        let ttl = secs(self.config.lease_ttl_secs);
        let log_every = secs(self.config.heartbeat_log_interval_secs);
        self.mutate(token.job_id, |tx| {
            let now = tx.now();
            let lease = tx
                .job()
                .leases
                .iter()
                .find(|l| l.id == token.id)
                .cloned()
                .ok_or(OrchestratorError::LeaseNotHeld(token.id))?;
            if !lease.is_live(now) {
                return Err(OrchestratorError::LeaseExpired(token.id));
            }

            if let LeaseUnit::Task(task_id) = &lease.unit {
                let dispatched = tx
                    .job()
                    .task(task_id)
                    .is_some_and(|t| t.status == TaskStatus::Dispatched);
                if dispatched {
                    tx.move_task(
                        task_id,
                        TaskStatus::Running,
                        EventKind::TaskRunning,
                        json!({ "worker": lease.worker, "lease_id": lease.id }),
                    )?;
                } else if now - lease.heartbeat_logged_at >= log_every {
                    tx.emit(
                        EventKind::TaskHeartbeat,
                        Some(task_id.clone()),
                        json!({ "worker": lease.worker, "lease_id": lease.id }),
                    );
                }
            }

            let logged = tx.has_events();
            let held = tx
                .job_mut()
                .leases
                .iter_mut()
                .find(|l| l.id == token.id)
                .ok_or(OrchestratorError::LeaseNotHeld(token.id))?;
            held.expires_at = now + ttl;
            held.heartbeat_at = now;
            if logged {
                held.heartbeat_logged_at = now;
            }
            Ok(LeaseToken::from(&*held))
        })
        .await
    }

    /// Hands the outcome of a leased task to the classifier and the state machine.
    ///
    /// An outcome arriving after its lease was dropped or expired is recorded
    /// as `late_outcome_discarded` and rejected with `LeaseNotHeld` /
    /// `LeaseExpired`.
    pub async fn release(
        &self,
        token: &LeaseToken,
        outcome: ExecutionOutcome,
    ) -> Result<Option<Decision>, OrchestratorError> {
        let max_attempts = self.config.retry.max_attempts;
        let released = self
            .mutate(token.job_id, |tx| {
                let now = tx.now();
                let held = tx.job().leases.iter().find(|l| l.id == token.id).cloned();
                let lease = match held {
                    Some(lease) if lease.is_live(now) => lease,
                    other => {
                        let expired = other.is_some();
                        let reason = if expired { "lease_expired" } else { "lease_not_held" };
                        let task_id = match &token.unit {
                            LeaseUnit::Task(id) => Some(id.clone()),
                            LeaseUnit::Planning => None,
                        };
                        tx.emit(
                            EventKind::LateOutcomeDiscarded,
                            task_id,
                            json!({
                                "lease_id": token.id,
                                "worker": token.worker,
                                "reason": reason,
                                "outcome": outcome,
                            }),
                        );
                        return Ok(Released::Discarded { expired });
                    }
                };
                let LeaseUnit::Task(task_id) = &lease.unit else {
                    return Err(OrchestratorError::LeaseNotHeld(token.id));
                };
                tx.job_mut().remove_lease(&lease.unit);
                let decision =
                    tx.apply_outcome(task_id, outcome.clone(), self.decider.as_ref(), max_attempts)?;
                Ok(Released::Applied(decision))
            })
            .await?;

        match released {
            Released::Applied(decision) => Ok(decision),
            Released::Discarded { expired: true } => {
                warn!(job_id = %token.job_id, lease_id = %token.id, "late outcome discarded: lease expired");
                Err(OrchestratorError::LeaseExpired(token.id))
            }
            Released::Discarded { expired: false } => {
                warn!(job_id = %token.job_id, lease_id = %token.id, "late outcome discarded: lease not held");
                Err(OrchestratorError::LeaseNotHeld(token.id))
            }
        }
    }

    /// Turns stale leases back into runnable work. Returns how many were recovered.
    ///
    /// The lease is removed in the same write that moves its unit back, so a
    /// staleness episode is recovered exactly once.
    pub async fn recover_stale(&self) -> Result<usize, OrchestratorError> {
        let stale_after = secs(self.config.stale_after_secs);
        let now = self.clock.now();
        let mut recovered = 0;
        for job in self.store.list_jobs(false).await? {
            if !job.leases.iter().any(|l| l.is_stale(now, stale_after)) {
                continue;
            }
            match self.recover_job(job.id, stale_after).await {
                Ok(n) => recovered += n,
                Err(OrchestratorError::LeaseConflict(job_id)) => {
                    warn!(%job_id, "stale recovery gave up after repeated conflicts");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    async fn recover_job(
        &self,
        job_id: JobId,
        stale_after: chrono::Duration,
    ) -> Result<usize, OrchestratorError> {
        let threshold = self.config.stale_alert_threshold;
        self.mutate(job_id, |tx| {
            let now = tx.now();
            let stale: Vec<Lease> = tx
                .job()
                .leases
                .iter()
                .filter(|l| l.is_stale(now, stale_after))
                .cloned()
                .collect();
            for lease in &stale {
                tx.job_mut().remove_lease(&lease.unit);
                let reason = if lease.is_live(now) { "heartbeat_silent" } else { "lease_expired" };
                let payload = json!({
                    "lease_id": lease.id,
                    "worker": lease.worker,
                    "reason": reason,
                });
                match &lease.unit {
                    LeaseUnit::Task(task_id) => {
                        let in_flight = tx
                            .job()
                            .task(task_id)
                            .is_some_and(|t| t.status.is_in_flight());
                        if !in_flight {
                            continue;
                        }
                        tx.move_task(task_id, TaskStatus::Pending, EventKind::StaleRecovered, payload)?;
                        let recoveries = match tx.job_mut().task_mut(task_id) {
                            Some(task) => {
                                task.stale_recoveries += 1;
                                task.stale_recoveries
                            }
                            None => 0,
                        };
                        warn!(%job_id, task_id = %task_id, worker = %lease.worker, reason, recoveries, "recovered stale task lease");
                        if recoveries >= threshold {
                            error!(%job_id, task_id = %task_id, recoveries, "task keeps going stale");
                            tx.emit(
                                EventKind::StaleAlert,
                                Some(task_id.clone()),
                                json!({ "recoveries": recoveries, "threshold": threshold }),
                            );
                        }
                    }
                    LeaseUnit::Planning => {
                        if tx.job().status != JobStatus::Planning {
                            continue;
                        }
                        tx.move_job(JobStatus::Submitted, EventKind::StaleRecovered, payload)?;
                        warn!(%job_id, worker = %lease.worker, reason, "recovered stale planning lease");
                    }
                }
            }
            Ok(stale.len())
        })
        .await
    }

    /// Leases up to `n` jobs that need a (re)plan and moves them to `planning`.
    pub async fn claim_planning(
        &self,
        worker: &WorkerId,
        n: usize,
    ) -> Result<Vec<PlanningClaim>, OrchestratorError> {
        let mut claims = Vec::new();
        for job in self.store.list_jobs(false).await? {
            if claims.len() >= n {
                break;
            }
            if !job.status.needs_planning() {
                continue;
            }
            let claimed = self
                .mutate(job.id, |tx| {
                    if !tx.job().status.needs_planning() {
                        return Ok(None);
                    }
                    let now = tx.now();
                    let job_id = tx.job().id;
                    let lease = Lease {
                        id: self.ids.generate_lease_id(),
                        job_id,
                        run_id: None,
                        unit: LeaseUnit::Planning,
                        worker: worker.clone(),
                        acquired_at: now,
                        expires_at: now + secs(self.config.lease_ttl_secs),
                        heartbeat_at: now,
                        heartbeat_logged_at: now,
                    };
                    let attempt = tx.job().planning_attempts + 1;
                    tx.move_job(
                        JobStatus::Planning,
                        EventKind::PlanningStarted,
                        json!({ "worker": worker, "lease_id": lease.id, "attempt": attempt }),
                    )?;
                    let job = tx.job_mut();
                    job.planning_attempts = attempt;
                    let context = PlanningContext {
                        job_id,
                        project: job.project.clone(),
                        feedback: job.audit.feedback_history(),
                        previous_plan: job.tasks.iter().map(|t| t.spec.clone()).collect(),
                        attempt,
                    };
                    let claim = PlanningClaim {
                        token: LeaseToken::from(&lease),
                        goal: job.goal.clone(),
                        context,
                    };
                    job.leases.push(lease);
                    Ok(Some(claim))
                })
                .await;
            match claimed {
                Ok(Some(claim)) => claims.push(claim),
                Ok(None) => {}
                Err(OrchestratorError::LeaseConflict(job_id)) => {
                    warn!(%job_id, "planning claim gave up after repeated conflicts");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(claims)
    }

    /// Records the decomposer's answer for a planning lease.
    ///
    /// A valid plan moves the job to `awaiting_audit`. An unavailable
    /// decomposer sends the job back to `submitted` while planning attempts
    /// remain; anything else leaves it in `planning` with `planning_error`
    /// set until an operator revises or cancels it.
    pub async fn complete_planning(
        &self,
        token: &LeaseToken,
        result: Result<Vec<TaskSpec>, DecompositionError>,
    ) -> Result<JobStatus, OrchestratorError> {
        let max_attempts = self.config.retry.max_attempts;
        self.mutate(token.job_id, |tx| {
            let held = tx
                .job()
                .leases
                .iter()
                .any(|l| l.id == token.id && l.is_live(tx.now()));
            if !held {
                return Err(OrchestratorError::LeaseNotHeld(token.id));
            }
            tx.job_mut().remove_lease(&LeaseUnit::Planning);

            let (message, retryable) = match &result {
                Ok(specs) => match ExecutionGraph::build(specs) {
                    Ok(graph) => {
                        info!(job_id = %token.job_id, tasks = graph.len(), "plan accepted");
                        tx.apply_plan(specs.clone())?;
                        return Ok(tx.job().status);
                    }
                    Err(e) => (e.to_string(), false),
                },
                Err(e) => (
                    PlanningError::Decomposition(e.to_string()).to_string(),
                    matches!(e, DecompositionError::Unavailable(_)),
                ),
            };

            let attempt = tx.job().planning_attempts;
            tx.job_mut().planning_error = Some(message.clone());
            let payload = json!({ "error": message, "attempt": attempt, "retryable": retryable });
            warn!(job_id = %token.job_id, attempt, error = %message, "planning failed");
            if retryable && attempt < max_attempts {
                tx.move_job(JobStatus::Submitted, EventKind::PlanningFailed, payload)?;
            } else {
                tx.emit(EventKind::PlanningFailed, None, payload);
            }
            Ok(tx.job().status)
        })
        .await
    }

    /// Fails every running job whose current run exceeded `job_timeout`.
    pub async fn enforce_job_timeouts(&self) -> Result<usize, OrchestratorError> {
        let budget = self.config.job_timeout_secs;
        let now = self.clock.now();
        let mut timed_out = 0;
        for job in self.store.list_jobs(false).await? {
            let over_budget = |job: &JobRecord| {
                job.status == JobStatus::Running
                    && job
                        .current_run_record()
                        .is_some_and(|run| now - run.started_at >= secs(budget))
            };
            if !over_budget(&job) {
                continue;
            }
            let applied = self
                .mutate(job.id, |tx| {
                    if !over_budget(tx.job()) {
                        return Ok(false);
                    }
                    tx.time_out(budget)?;
                    Ok(true)
                })
                .await;
            match applied {
                Ok(true) => {
                    error!(job_id = %job.id, budget_secs = budget, "job timed out");
                    timed_out += 1;
                }
                Ok(false) => {}
                Err(OrchestratorError::LeaseConflict(job_id)) => {
                    warn!(%job_id, "job timeout gave up after repeated conflicts");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(timed_out)
    }
}
