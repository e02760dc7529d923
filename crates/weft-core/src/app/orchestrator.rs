//! Orchestrator - オペレータ向けの入口
//!
//! submit / audit（approve・revise・cancel）/ resume / status / events を
//! 提供します。書き込みはすべて `Coordinator::mutate` を通るので、
//! ワーカーと同じ CAS 規律に従います。

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::app::coordinator::Coordinator;
use crate::app::status::{self, StatusReport};
use crate::app::worker_loop::Worker;
use crate::domain::{
    AuditDecision, Event, EventDraft, EventKind, HumanInput, JobId, JobRecord, JobStatus,
    OrchestratorError, TaskId, TaskStatus, WorkerId,
};
use crate::ports::{Decomposer, Executor};

/// Result of `resume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAck {
    Resumed,
    /// The question was already answered; nothing changed.
    AlreadyConsumed,
}

pub struct Orchestrator {
    coordinator: Arc<Coordinator>,
    decomposer: Arc<dyn Decomposer>,
    executor: Arc<dyn Executor>,
}

impl Orchestrator {
    pub(crate) fn new(
        coordinator: Arc<Coordinator>,
        decomposer: Arc<dyn Decomposer>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            coordinator,
            decomposer,
            executor,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// A worker sharing this orchestrator's store and collaborators.
    pub fn worker(&self, id: impl Into<WorkerId>) -> Worker {
        Worker::new(
            id.into(),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.decomposer),
            Arc::clone(&self.executor),
        )
    }

    pub async fn submit(&self, goal: &str, project: &str) -> Result<JobId, OrchestratorError> {
        let c = &self.coordinator;
        let now = c.now();
        let job = JobRecord::new(c.ids().generate_job_id(), goal.to_string(), project.to_string(), now);
        let event = EventDraft::new(job.id, None, EventKind::JobSubmitted, now)
            .job_status(JobStatus::Submitted)
            .payload(json!({ "goal": goal, "project": project }));
        c.insert(&job, &[event]).await?;
        info!(job_id = %job.id, project, "job submitted");
        Ok(job.id)
    }

    pub async fn status(&self, job_id: JobId) -> Result<StatusReport, OrchestratorError> {
        let store = self.coordinator.store();
        let job = store.load_job(job_id).await?;
        let events = store.events(job_id).await?;
        Ok(status::resolve(&job, &events))
    }

    pub async fn events(&self, job_id: JobId) -> Result<Vec<Event>, OrchestratorError> {
        let store = self.coordinator.store();
        store.load_job(job_id).await?;
        Ok(store.events(job_id).await?)
    }

    /// Approves the current plan. Returns the new audit revision.
    pub async fn approve(&self, job_id: JobId) -> Result<u32, OrchestratorError> {
        self.coordinator
            .mutate(job_id, |tx| {
                let from = tx.job().status;
                if !from.can_transition_to(JobStatus::Approved) {
                    return Err(OrchestratorError::invalid_job_transition(from, JobStatus::Approved));
                }
                let now = tx.now();
                tx.job_mut().audit.record(AuditDecision::Approve, now);
                let revision = tx.job().audit.revision;
                tx.move_job(
                    JobStatus::Approved,
                    EventKind::AuditApproved,
                    json!({ "revision": revision }),
                )?;
                Ok(revision)
            })
            .await
    }

    /// Rejects the current plan; the job is re-planned with `feedback`.
    ///
    /// Allowed while awaiting audit, after approval but before any dispatch,
    /// and while planning is stuck on an error.
    pub async fn revise(&self, job_id: JobId, feedback: &str) -> Result<u32, OrchestratorError> {
        self.coordinator
            .mutate(job_id, |tx| {
                let from = tx.job().status;
                let allowed = match from {
                    JobStatus::AwaitingAudit | JobStatus::Approved => true,
                    JobStatus::Planning => tx.job().planning_error.is_some(),
                    _ => false,
                };
                if !allowed {
                    return Err(OrchestratorError::invalid_job_transition(from, JobStatus::Revising));
                }
                let now = tx.now();
                let decision = AuditDecision::Revise {
                    feedback: feedback.to_string(),
                };
                tx.job_mut().audit.record(decision, now);
                let revision = tx.job().audit.revision;
                tx.move_job(
                    JobStatus::Revising,
                    EventKind::AuditReviseRequested,
                    json!({ "revision": revision, "feedback": feedback }),
                )?;
                Ok(revision)
            })
            .await
    }

    /// Cancels the job, its open tasks and all leases.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), OrchestratorError> {
        self.coordinator
            .mutate(job_id, |tx| {
                let from = tx.job().status;
                if !from.can_transition_to(JobStatus::Cancelled) {
                    return Err(OrchestratorError::invalid_job_transition(from, JobStatus::Cancelled));
                }
                let now = tx.now();
                tx.job_mut().audit.record(AuditDecision::Cancel, now);
                let revision = tx.job().audit.revision;
                tx.cancel_open_tasks("job cancelled by operator")?;
                tx.move_job(
                    JobStatus::Cancelled,
                    EventKind::JobCancelled,
                    json!({ "revision": revision }),
                )
            })
            .await
    }

    /// Answers the question a task is waiting on.
    ///
    /// The answer is keyed by the task and its question hash; answering an
    /// already consumed question is a no-op. A paused job continues in a new run.
    pub async fn resume(
        &self,
        job_id: JobId,
        task_id: &TaskId,
        answer: &str,
    ) -> Result<ResumeAck, OrchestratorError> {
        let answer = answer.trim();
        if answer.is_empty() {
            return Err(OrchestratorError::InvalidAnswer("answer must not be empty".into()));
        }
        let ids = self.coordinator.ids();
        self.coordinator
            .mutate(job_id, |tx| {
                let now = tx.now();
                let task = tx
                    .job()
                    .task(task_id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound {
                        job_id,
                        task_id: task_id.clone(),
                    })?;

                let question = match (&task.pending_question, task.status) {
                    (Some(q), TaskStatus::WaitingHuman) => q.clone(),
                    _ => {
                        let consumed = task
                            .human_inputs
                            .last()
                            .is_some_and(|h| task.consumed_questions.contains(&h.question_hash));
                        if consumed {
                            return Ok(ResumeAck::AlreadyConsumed);
                        }
                        return Err(OrchestratorError::invalid_task_transition(
                            task.status,
                            TaskStatus::Pending,
                        ));
                    }
                };
                if task.consumed_questions.contains(&question.question_hash) {
                    return Ok(ResumeAck::AlreadyConsumed);
                }

                if let Some(task) = tx.job_mut().task_mut(task_id) {
                    task.consumed_questions.insert(question.question_hash.clone());
                    task.human_inputs.push(HumanInput {
                        question: question.question.clone(),
                        question_hash: question.question_hash.clone(),
                        answer: answer.to_string(),
                        answered_at: now,
                    });
                    task.pending_question = None;
                    // 回答で入力が変わるので試行回数は数え直す
                    task.attempts = 0;
                }
                tx.move_task(
                    task_id,
                    TaskStatus::Pending,
                    EventKind::AnswerConsumed,
                    json!({ "question_hash": question.question_hash }),
                )?;
                if tx.job().status == JobStatus::WaitingHuman {
                    tx.start_run(ids.generate_run_id(), EventKind::JobResumed)?;
                }
                Ok(ResumeAck::Resumed)
            })
            .await
    }
}
