//! State - タスクとジョブの状態
//!
//! 状態は単一の enum で持ち、遷移可否はここで一元的に判定します。
//! 実際の遷移（イベント発行を含む）は `machine` モジュールが行います。

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskStatus はタスクの状態を表現
///
/// # 状態遷移
/// - pending → dispatched → running → completed | failed | waiting_human
/// - waiting_human → pending（resume）| cancelled
/// - dispatched | running → pending（retry / stale recovery）
/// - pending → unreachable（祖先が terminal failure）
/// - 非 terminal → cancelled（job cancel / job timeout）
///
/// retry は「失敗 → pending」を 1 つの `task_retry_scheduled` イベントで記録し、
/// `failed` を経由しません。`failed` に入るのは terminal failure だけです。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
    WaitingHuman,
    Cancelled,
    Unreachable,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::Unreachable
        )
    }

    /// lease を持って実行中（in-flight）かどうか
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Dispatched | TaskStatus::Running)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Dispatched) => true,
            (Dispatched, Running) => true,
            (Running, Completed | Failed | WaitingHuman) => true,
            // outcome が running 遷移の前に戻ってくる（ハートビート前に完了）ケース
            (Dispatched, Completed | Failed | WaitingHuman) => true,
            (WaitingHuman, Pending) => true,
            (Dispatched | Running, Pending) => true,
            (Pending, Unreachable) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::WaitingHuman => "waiting_human",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JobStatus はジョブ全体の状態を表現
///
/// # 状態遷移
/// - submitted → planning → awaiting_audit → approved | revising | cancelled
/// - approved → running → completed | failed | waiting_human
/// - waiting_human → running（resume）
/// - revising → planning
/// - approved → revising（実行開始前の差し戻し）
/// - planning → revising（計画失敗後の差し戻し）
/// - planning → submitted（planning lease の stale recovery）
/// - 非 terminal → cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Planning,
    AwaitingAudit,
    Approved,
    Revising,
    Running,
    Completed,
    Failed,
    WaitingHuman,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// スケジューラがタスクを払い出してよい状態
    pub fn is_executable(self) -> bool {
        matches!(self, JobStatus::Approved | JobStatus::Running)
    }

    /// decomposer に渡すべき状態（planning lease の取得対象）
    pub fn needs_planning(self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Revising)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Submitted, Planning) => true,
            (Planning, AwaitingAudit | Revising | Submitted) => true,
            (AwaitingAudit, Approved | Revising) => true,
            (Approved, Running | Revising) => true,
            (Revising, Planning) => true,
            (Running, Completed | Failed | WaitingHuman) => true,
            (WaitingHuman, Running | Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Planning => "planning",
            JobStatus::AwaitingAudit => "awaiting_audit",
            JobStatus::Approved => "approved",
            JobStatus::Revising => "revising",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::WaitingHuman => "waiting_human",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::dispatch(TaskStatus::Pending, TaskStatus::Dispatched, true)]
    #[case::start(TaskStatus::Dispatched, TaskStatus::Running, true)]
    #[case::complete(TaskStatus::Running, TaskStatus::Completed, true)]
    #[case::escalate(TaskStatus::Running, TaskStatus::WaitingHuman, true)]
    #[case::resume(TaskStatus::WaitingHuman, TaskStatus::Pending, true)]
    #[case::retry(TaskStatus::Running, TaskStatus::Pending, true)]
    #[case::reopen_failed(TaskStatus::Failed, TaskStatus::Pending, false)]
    #[case::recover(TaskStatus::Dispatched, TaskStatus::Pending, true)]
    #[case::skip_dispatch(TaskStatus::Pending, TaskStatus::Running, false)]
    #[case::reopen_completed(TaskStatus::Completed, TaskStatus::Pending, false)]
    #[case::cancel_completed(TaskStatus::Completed, TaskStatus::Cancelled, false)]
    #[case::cancel_waiting(TaskStatus::WaitingHuman, TaskStatus::Cancelled, true)]
    #[case::revive_unreachable(TaskStatus::Unreachable, TaskStatus::Pending, false)]
    fn task_transitions(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[rstest]
    #[case::plan(JobStatus::Submitted, JobStatus::Planning, true)]
    #[case::planned(JobStatus::Planning, JobStatus::AwaitingAudit, true)]
    #[case::approve(JobStatus::AwaitingAudit, JobStatus::Approved, true)]
    #[case::revise(JobStatus::AwaitingAudit, JobStatus::Revising, true)]
    #[case::revise_approved(JobStatus::Approved, JobStatus::Revising, true)]
    #[case::replan(JobStatus::Revising, JobStatus::Planning, true)]
    #[case::resume(JobStatus::WaitingHuman, JobStatus::Running, true)]
    #[case::skip_audit(JobStatus::Planning, JobStatus::Approved, false)]
    #[case::revise_running(JobStatus::Running, JobStatus::Revising, false)]
    #[case::cancel_terminal(JobStatus::Completed, JobStatus::Cancelled, false)]
    #[case::cancel_running(JobStatus::Running, JobStatus::Cancelled, true)]
    fn job_transitions(#[case] from: JobStatus, #[case] to: JobStatus, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::AwaitingAudit).unwrap(),
            "\"awaiting_audit\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::WaitingHuman).unwrap(),
            "\"waiting_human\""
        );
    }
}
