//! Run - ジョブのタスク集合を 1 回実行する単位
//!
//! 承認済みジョブの実行開始時と、waiting_human からの resume 時に新しい run が
//! 開きます。status の解決に使うのは最新の run だけです。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::RunId;
use super::state::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    WaitingHuman,
    Cancelled,
}

impl RunStatus {
    /// 一度 finalize された run はもう書き換わらない
    pub fn is_final(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_job_status(self) -> JobStatus {
        match self {
            RunStatus::Running => JobStatus::Running,
            RunStatus::Completed => JobStatus::Completed,
            RunStatus::Failed => JobStatus::Failed,
            RunStatus::WaitingHuman => JobStatus::WaitingHuman,
            RunStatus::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn from_job_status(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Running => Some(RunStatus::Running),
            JobStatus::Completed => Some(RunStatus::Completed),
            JobStatus::Failed => Some(RunStatus::Failed),
            JobStatus::WaitingHuman => Some(RunStatus::WaitingHuman),
            JobStatus::Cancelled => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn start(id: RunId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: RunStatus::Running,
            started_at: now,
            finished_at: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, now: DateTime<Utc>) {
        if self.status.is_final() {
            return;
        }
        self.status = status;
        if status.is_final() {
            self.finished_at = Some(now);
        }
    }
}
