//! Notifier port - fire-and-forget な通知
//!
//! 通知の失敗はオーケストレーションを止めません。呼び出し側は
//! `tracing::warn!` で記録して捨てます。

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{Event, EventKind, JobId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub job_id: JobId,
    pub task_id: Option<TaskId>,
    pub kind: EventKind,
    pub severity: Severity,
    pub payload: serde_json::Value,
}

impl Notification {
    /// Events an operator wants to hear about; the rest stay in the log.
    pub fn from_event(event: &Event) -> Option<Self> {
        let severity = match event.kind {
            EventKind::TaskFailed
            | EventKind::JobFailed
            | EventKind::JobTimedOut
            | EventKind::StaleAlert
            | EventKind::PlanningFailed => Severity::Error,
            EventKind::TaskRetryScheduled
            | EventKind::StaleRecovered
            | EventKind::LateOutcomeDiscarded => Severity::Warn,
            EventKind::PlanReady
            | EventKind::TaskWaitingHuman
            | EventKind::JobWaitingHuman
            | EventKind::JobCompleted
            | EventKind::JobCancelled
            | EventKind::JobResumed => Severity::Info,
            _ => return None,
        };
        Some(Self {
            job_id: event.job_id,
            task_id: event.task_id.clone(),
            kind: event.kind,
            severity,
            payload: event.payload.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventDraft;
    use chrono::Utc;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case::failed(EventKind::TaskFailed, Some(Severity::Error))]
    #[case::retry(EventKind::TaskRetryScheduled, Some(Severity::Warn))]
    #[case::waiting(EventKind::TaskWaitingHuman, Some(Severity::Info))]
    #[case::heartbeat(EventKind::TaskHeartbeat, None)]
    #[case::dispatch(EventKind::TaskDispatched, None)]
    fn severity_by_kind(#[case] kind: EventKind, #[case] expected: Option<Severity>) {
        let event = EventDraft::new(JobId::from_ulid(Ulid::new()), None, kind, Utc::now())
            .into_event(1);
        assert_eq!(Notification::from_event(&event).map(|n| n.severity), expected);
    }
}
