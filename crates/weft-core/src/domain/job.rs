//! Job record: the aggregate the store persists and CASes as one unit.
//!
//! Tasks, runs, leases and the audit record all live inside the job row, so a
//! single compare-and-swap on `version` covers every mutation of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::audit::AuditRecord;
use super::decision::FailureReport;
use super::ids::{JobId, RunId, TaskId};
use super::lease::{Lease, LeaseUnit};
use super::run::RunRecord;
use super::state::{JobStatus, TaskStatus};
use super::task::TaskRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub goal: String,
    pub project: String,
    pub status: JobStatus,
    /// Tasks in declared order.
    pub tasks: Vec<TaskRecord>,
    pub audit: AuditRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub current_run: Option<RunId>,
    pub runs: Vec<RunRecord>,
    pub leases: Vec<Lease>,
    /// Last decomposition failure; cleared by a successful plan.
    pub planning_error: Option<String>,
    #[serde(default)]
    pub planning_attempts: u32,
    #[serde(default)]
    pub failures: Vec<FailureReport>,
    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: u64,
}

impl JobRecord {
    pub fn new(id: JobId, goal: String, project: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            goal,
            project,
            status: JobStatus::Submitted,
            tasks: Vec::new(),
            audit: AuditRecord::new(),
            created_at: now,
            updated_at: now,
            current_run: None,
            runs: Vec::new(),
            leases: Vec::new(),
            planning_error: None,
            planning_attempts: 0,
            failures: Vec::new(),
            version: 0,
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id() == task_id)
    }

    pub fn task_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id() == task_id)
    }

    pub fn lease_for(&self, unit: &LeaseUnit) -> Option<&Lease> {
        self.leases.iter().find(|l| &l.unit == unit)
    }

    pub fn remove_lease(&mut self, unit: &LeaseUnit) -> Option<Lease> {
        let index = self.leases.iter().position(|l| &l.unit == unit)?;
        Some(self.leases.remove(index))
    }

    pub fn current_run_record(&self) -> Option<&RunRecord> {
        let run_id = self.current_run?;
        self.runs.iter().find(|r| r.id == run_id)
    }

    pub fn current_run_record_mut(&mut self) -> Option<&mut RunRecord> {
        let run_id = self.current_run?;
        self.runs.iter_mut().find(|r| r.id == run_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_in_flight()).count()
    }

    pub fn count_tasks(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskSpec;
    use ulid::Ulid;

    #[test]
    fn new_job_starts_submitted_without_run() {
        let job = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            "ship it".into(),
            "default".into(),
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Submitted);
        assert!(job.current_run_record().is_none());
        assert!(!job.audit.permits_dispatch());
    }

    #[test]
    fn job_roundtrips_through_json() {
        let now = Utc::now();
        let mut job = JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            "g".into(),
            "p".into(),
            now,
        );
        let mut task = TaskRecord::new(TaskSpec::new("a", &[]), 0, now);
        task.consumed_questions.insert("abc123".into());
        job.tasks.push(task);

        let json = serde_json::to_string(&job).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }
}
