//! Events - 追記専用のイベントログ
//!
//! すべての遷移・lease 操作・audit 判断はイベントとして記録されます。
//! job 行はイベントログから導出されるキャッシュで、両者は同じ CAS で
//! 書き込まれます（イベントが先）。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{JobId, RunId, TaskId};
use super::state::{JobStatus, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobSubmitted,
    PlanningStarted,
    PlanReady,
    PlanningFailed,
    AuditApproved,
    AuditReviseRequested,
    JobCancelled,
    RunStarted,
    TaskDispatched,
    TaskRunning,
    TaskHeartbeat,
    TaskCompleted,
    TaskRetryScheduled,
    TaskFailed,
    TaskUnreachable,
    TaskWaitingHuman,
    TaskCancelled,
    AnswerConsumed,
    JobResumed,
    StaleRecovered,
    StaleAlert,
    LateOutcomeDiscarded,
    JobCompleted,
    JobFailed,
    JobWaitingHuman,
    JobTimedOut,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::JobSubmitted => "job_submitted",
            EventKind::PlanningStarted => "planning_started",
            EventKind::PlanReady => "plan_ready",
            EventKind::PlanningFailed => "planning_failed",
            EventKind::AuditApproved => "audit_approved",
            EventKind::AuditReviseRequested => "audit_revise_requested",
            EventKind::JobCancelled => "job_cancelled",
            EventKind::RunStarted => "run_started",
            EventKind::TaskDispatched => "task_dispatched",
            EventKind::TaskRunning => "task_running",
            EventKind::TaskHeartbeat => "task_heartbeat",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskRetryScheduled => "task_retry_scheduled",
            EventKind::TaskFailed => "task_failed",
            EventKind::TaskUnreachable => "task_unreachable",
            EventKind::TaskWaitingHuman => "task_waiting_human",
            EventKind::TaskCancelled => "task_cancelled",
            EventKind::AnswerConsumed => "answer_consumed",
            EventKind::JobResumed => "job_resumed",
            EventKind::StaleRecovered => "stale_recovered",
            EventKind::StaleAlert => "stale_alert",
            EventKind::LateOutcomeDiscarded => "late_outcome_discarded",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::JobWaitingHuman => "job_waiting_human",
            EventKind::JobTimedOut => "job_timed_out",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event before the store assigns it a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    pub run_id: Option<RunId>,
    pub task_id: Option<TaskId>,
    pub kind: EventKind,
    /// Job status after this event, when the event changed it.
    pub job_status: Option<JobStatus>,
    /// Task status after this event, when the event changed it.
    pub task_status: Option<TaskStatus>,
    pub payload: serde_json::Value,
}

impl EventDraft {
    pub fn new(job_id: JobId, run_id: Option<RunId>, kind: EventKind, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            job_id,
            run_id,
            task_id: None,
            kind,
            job_status: None,
            task_status: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn task(mut self, task_id: TaskId, status: Option<TaskStatus>) -> Self {
        self.task_id = Some(task_id);
        self.task_status = status;
        self
    }

    pub fn job_status(mut self, status: JobStatus) -> Self {
        self.job_status = Some(status);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn into_event(self, sequence: u64) -> Event {
        Event {
            sequence,
            timestamp: self.timestamp,
            job_id: self.job_id,
            run_id: self.run_id,
            task_id: self.task_id,
            kind: self.kind,
            job_status: self.job_status,
            task_status: self.task_status,
            payload: self.payload,
        }
    }
}

/// Immutable, sequenced event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    pub run_id: Option<RunId>,
    pub task_id: Option<TaskId>,
    pub kind: EventKind,
    pub job_status: Option<JobStatus>,
    pub task_status: Option<TaskStatus>,
    pub payload: serde_json::Value,
}

/// Folds the job status recorded in `events` for one run.
///
/// `run_id = None` folds across the whole log.
pub fn fold_job_status(events: &[Event], run_id: Option<RunId>) -> Option<JobStatus> {
    events
        .iter()
        .filter(|e| run_id.is_none() || e.run_id == run_id)
        .filter_map(|e| e.job_status)
        .last()
}
