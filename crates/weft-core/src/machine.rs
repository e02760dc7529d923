//! Job/Task state machine.
//!
//! A `Transition` borrows one job aggregate, applies validated status
//! changes to it and collects the events they produce. The caller commits
//! the mutated job and the collected events together with one CAS, so a
//! transition is either fully visible or not at all.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::domain::{
    Decider, Decision, ErrorClass, EventDraft, EventKind, ExecutionOutcome, FailureReport, JobRecord,
    JobStatus, OrchestratorError, PendingQuestion, RunId, RunRecord, RunStatus, TaskError, TaskId,
    TaskRecord, TaskSpec, TaskStatus, question_hash,
};
use crate::scheduler::Scheduler;

pub struct Transition<'a> {
    job: &'a mut JobRecord,
    now: DateTime<Utc>,
    events: Vec<EventDraft>,
}

impl<'a> Transition<'a> {
    pub fn new(job: &'a mut JobRecord, now: DateTime<Utc>) -> Self {
        Self {
            job,
            now,
            events: Vec::new(),
        }
    }

    pub fn job(&self) -> &JobRecord {
        self.job
    }

    /// Direct access for bookkeeping that is not a status change
    /// (leases, counters). Status changes go through `move_*`.
    pub fn job_mut(&mut self) -> &mut JobRecord {
        self.job
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<EventDraft> {
        self.events
    }

    fn draft(&self, kind: EventKind) -> EventDraft {
        EventDraft::new(self.job.id, self.job.current_run, kind, self.now)
    }

    /// Appends an event that does not change any status.
    pub fn emit(&mut self, kind: EventKind, task_id: Option<TaskId>, payload: serde_json::Value) {
        let mut draft = self.draft(kind).payload(payload);
        if let Some(task_id) = task_id {
            draft = draft.task(task_id, None);
        }
        self.events.push(draft);
        self.job.updated_at = self.now;
    }

    pub fn move_job(
        &mut self,
        to: JobStatus,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let from = self.job.status;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::invalid_job_transition(from, to));
        }
        self.job.status = to;
        self.job.updated_at = self.now;
        if let Some(run_status) = RunStatus::from_job_status(to) {
            let now = self.now;
            if let Some(run) = self.job.current_run_record_mut() {
                run.finish(run_status, now);
            }
        }
        let draft = self.draft(kind).job_status(to).payload(payload);
        self.events.push(draft);
        info!(job_id = %self.job.id, %from, %to, event = %kind, "job transition");
        Ok(())
    }

    pub fn move_task(
        &mut self,
        task_id: &TaskId,
        to: TaskStatus,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let job_id = self.job.id;
        let now = self.now;
        let task = self
            .job
            .task_mut(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound {
                job_id,
                task_id: task_id.clone(),
            })?;
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::invalid_task_transition(from, to));
        }
        task.status = to;
        task.updated_at = now;
        self.job.updated_at = now;
        let draft = self
            .draft(kind)
            .task(task_id.clone(), Some(to))
            .payload(payload);
        self.events.push(draft);
        debug!(%job_id, task_id = %task_id, %from, %to, "task transition");
        Ok(())
    }

    /// Opens a new run and moves the job to `running`.
    ///
    /// `kind` is `RunStarted` for the first run of an approved job and
    /// `JobResumed` when a paused job continues.
    pub fn start_run(&mut self, run_id: RunId, kind: EventKind) -> Result<(), OrchestratorError> {
        let from = self.job.status;
        if !from.can_transition_to(JobStatus::Running) {
            return Err(OrchestratorError::invalid_job_transition(from, JobStatus::Running));
        }
        self.job.current_run = Some(run_id);
        self.job.runs.push(RunRecord::start(run_id, self.now));
        self.move_job(JobStatus::Running, kind, json!({ "run_id": run_id }))
    }

    /// Replaces the task set with a freshly validated plan.
    pub fn apply_plan(&mut self, specs: Vec<TaskSpec>) -> Result<(), OrchestratorError> {
        let now = self.now;
        let count = specs.len();
        self.job.tasks = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| TaskRecord::new(spec, i, now))
            .collect();
        self.job.planning_error = None;
        self.job.audit.reset_for_new_plan(now);
        let revision = self.job.audit.revision;
        self.move_job(
            JobStatus::AwaitingAudit,
            EventKind::PlanReady,
            json!({ "tasks": count, "audit_revision": revision }),
        )
    }

    /// Applies the outcome of one dispatch to a leased task.
    ///
    /// Returns the classifier decision for failures, `None` for success.
    pub fn apply_outcome(
        &mut self,
        task_id: &TaskId,
        outcome: ExecutionOutcome,
        decider: &dyn Decider,
        max_attempts: u32,
    ) -> Result<Option<Decision>, OrchestratorError> {
        let job_id = self.job.id;
        let task = self
            .job
            .task(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound {
                job_id,
                task_id: task_id.clone(),
            })?;
        let attempts = task.attempts;
        let outcome = outcome.verify_outputs(&task.spec.outputs);

        let (class, message) = match outcome {
            ExecutionOutcome::Success { outputs } => {
                let keys: Vec<&String> = outputs.keys().collect();
                let payload = json!({ "outputs": keys, "attempt": attempts });
                self.move_task(task_id, TaskStatus::Completed, EventKind::TaskCompleted, payload)?;
                if let Some(task) = self.job.task_mut(task_id) {
                    task.outputs = outputs;
                    task.last_error = None;
                    task.not_before = None;
                }
                self.reconcile()?;
                return Ok(None);
            }
            ExecutionOutcome::Failure { class, message } => (class, message),
        };

        let decision = decider.decide(task_id, &class, &message, attempts, max_attempts);
        if let Some(task) = self.job.task_mut(task_id) {
            task.last_error = Some(TaskError {
                class: class.clone(),
                message: message.clone(),
            });
        }

        match &decision {
            Decision::Retry { delay, reason } => {
                let not_before = self.now
                    + chrono::Duration::from_std(*delay).unwrap_or(chrono::Duration::zero());
                let payload = json!({
                    "class": class.code(),
                    "message": message,
                    "attempt": attempts,
                    "max_attempts": max_attempts,
                    "delay_secs": delay.as_secs_f64(),
                    "reason": reason,
                });
                self.move_task(task_id, TaskStatus::Pending, EventKind::TaskRetryScheduled, payload)?;
                if let Some(task) = self.job.task_mut(task_id) {
                    task.not_before = Some(not_before);
                }
            }
            Decision::FailTerminal { report } => {
                self.fail_task(task_id, report.clone())?;
            }
            Decision::EscalateHuman { question } => {
                self.wait_for_human(task_id, question)?;
            }
        }
        self.reconcile()?;
        Ok(Some(decision))
    }

    fn fail_task(&mut self, task_id: &TaskId, report: FailureReport) -> Result<(), OrchestratorError> {
        let payload = serde_json::to_value(&report).unwrap_or_default();
        self.move_task(task_id, TaskStatus::Failed, EventKind::TaskFailed, payload)?;
        self.job.failures.push(report);
        self.mark_unreachable()
    }

    fn wait_for_human(&mut self, task_id: &TaskId, question: &str) -> Result<(), OrchestratorError> {
        let hash = question_hash(question);
        let payload = json!({ "question": question, "question_hash": hash });
        self.move_task(task_id, TaskStatus::WaitingHuman, EventKind::TaskWaitingHuman, payload)?;
        let now = self.now;
        if let Some(task) = self.job.task_mut(task_id) {
            // 同じ質問がもう一度来たら新しいエピソードとして扱う
            task.consumed_questions.remove(&hash);
            task.pending_question = Some(PendingQuestion {
                question: question.to_string(),
                question_hash: hash,
                asked_at: now,
            });
        }
        Ok(())
    }

    /// Marks every pending descendant of a terminally failed task unreachable.
    pub fn mark_unreachable(&mut self) -> Result<(), OrchestratorError> {
        let graph = Scheduler::graph_for(self.job)?;
        for task_id in Scheduler::unreachable(self.job, &graph) {
            self.move_task(
                &task_id,
                TaskStatus::Unreachable,
                EventKind::TaskUnreachable,
                json!({ "reason": "an upstream task failed" }),
            )?;
        }
        Ok(())
    }

    /// Derives the job status of a running (or paused) job from its tasks.
    ///
    /// - every task completed: `completed`
    /// - something can still progress: stays `running`
    /// - otherwise, any task waiting on a human: `waiting_human`
    /// - otherwise: `failed`
    pub fn reconcile(&mut self) -> Result<(), OrchestratorError> {
        if !matches!(self.job.status, JobStatus::Running) {
            return Ok(());
        }
        if self.job.tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            return self.move_job(JobStatus::Completed, EventKind::JobCompleted, json!({}));
        }
        let graph = Scheduler::graph_for(self.job)?;
        if Scheduler::can_progress(self.job, &graph) {
            return Ok(());
        }
        let waiting: Vec<serde_json::Value> = self
            .job
            .tasks
            .iter()
            .filter_map(|t| {
                t.pending_question
                    .as_ref()
                    .filter(|_| t.status == TaskStatus::WaitingHuman)
                    .map(|q| json!({ "task_id": t.id(), "question_hash": q.question_hash }))
            })
            .collect();
        if !waiting.is_empty() {
            return self.move_job(
                JobStatus::WaitingHuman,
                EventKind::JobWaitingHuman,
                json!({ "waiting": waiting }),
            );
        }
        let failures = serde_json::to_value(&self.job.failures).unwrap_or_default();
        self.move_job(JobStatus::Failed, EventKind::JobFailed, json!({ "failures": failures }))
    }

    /// Cancels every non-terminal task and drops all leases.
    pub fn cancel_open_tasks(&mut self, reason: &str) -> Result<(), OrchestratorError> {
        let open: Vec<TaskId> = self
            .job
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id().clone())
            .collect();
        for task_id in open {
            self.move_task(
                &task_id,
                TaskStatus::Cancelled,
                EventKind::TaskCancelled,
                json!({ "reason": reason }),
            )?;
        }
        self.job.leases.clear();
        Ok(())
    }

    /// Fails the whole job because its run exceeded the job timeout.
    pub fn time_out(&mut self, budget_secs: u64) -> Result<(), OrchestratorError> {
        let in_flight: Vec<TaskId> = self
            .job
            .tasks
            .iter()
            .filter(|t| t.status.is_in_flight())
            .map(|t| t.id().clone())
            .collect();
        for task_id in &in_flight {
            let report = FailureReport::new(
                task_id.clone(),
                ErrorClass::Timeout,
                format!("job exceeded its {budget_secs}s budget"),
            );
            self.job.failures.push(report);
        }
        self.emit(
            EventKind::JobTimedOut,
            None,
            json!({ "budget_secs": budget_secs, "in_flight": in_flight }),
        );
        self.cancel_open_tasks("job timeout")?;
        let failures = serde_json::to_value(&self.job.failures).unwrap_or_default();
        self.move_job(JobStatus::Failed, EventKind::JobFailed, json!({ "failures": failures }))
    }
}
