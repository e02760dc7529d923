//! Errors - エラー型と分類
//!
//! 実行時の失敗（executor の失敗）はエラーではなくデータ（`ErrorClass`）です。
//! ここにあるのは「オーケストレータ自身の操作が拒否された / 失敗した」ことを
//! 表すエラーだけです。

use super::ids::{JobId, LeaseId, TaskId};
use super::state::{JobStatus, TaskStatus};

/// Plan validation failures (graph builder / decomposer output).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanningError {
    #[error("task '{task}' depends on unknown task '{missing}'")]
    UnknownDependency { task: TaskId, missing: TaskId },

    #[error("dependency cycle detected involving task '{task}'")]
    CyclicDependency { task: TaskId },

    #[error("task '{0}' is declared more than once")]
    DuplicateTask(TaskId),

    #[error("plan contains no tasks")]
    EmptyPlan,

    #[error("decomposition failed: {0}")]
    Decomposition(String),
}

/// Persistence failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Another writer committed first; reload and retry.
    #[error("version conflict on {job_id}: expected {expected}, found {actual}")]
    VersionConflict {
        job_id: JobId,
        expected: u64,
        actual: u64,
    },

    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error("audit gate: job {job_id} cannot dispatch while latest decision is '{decision}'")]
    AuditGateViolation { job_id: JobId, decision: String },

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("task '{task_id}' not found in job {job_id}")]
    TaskNotFound { job_id: JobId, task_id: TaskId },

    #[error("lease {0} is not held")]
    LeaseNotHeld(LeaseId),

    #[error("lease {0} has expired")]
    LeaseExpired(LeaseId),

    /// Lost a claim race too many times. Internal; callers normally retry.
    #[error("lease conflict on job {0}")]
    LeaseConflict(JobId),

    #[error("invalid answer: {0}")]
    InvalidAnswer(String),

    #[error(transparent)]
    Store(StoreError),
}

impl OrchestratorError {
    pub fn invalid_job_transition(from: JobStatus, to: JobStatus) -> Self {
        OrchestratorError::InvalidTransition {
            entity: "job",
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn invalid_task_transition(from: TaskStatus, to: TaskStatus) -> Self {
        OrchestratorError::InvalidTransition {
            entity: "task",
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(job_id) => OrchestratorError::JobNotFound(job_id),
            StoreError::VersionConflict { job_id, .. } => OrchestratorError::LeaseConflict(job_id),
            other => OrchestratorError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn planning_error_messages_name_tasks() {
        let err = PlanningError::UnknownDependency {
            task: TaskId::new("b"),
            missing: TaskId::new("zz"),
        };
        assert_eq!(err.to_string(), "task 'b' depends on unknown task 'zz'");
    }

    #[test]
    fn version_conflict_maps_to_lease_conflict() {
        let job_id = JobId::from_ulid(Ulid::new());
        let err: OrchestratorError = StoreError::VersionConflict {
            job_id,
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(err, OrchestratorError::LeaseConflict(job_id));
    }
}
