//! JobStore port - job 集約とイベントログの正本（source of truth）
//!
//! # 設計原則
//! - job 集約（tasks / runs / leases / audit）は 1 行として保存する
//! - すべての更新は `version` に対する compare-and-swap
//! - イベントは job 行と同じ原子的な書き込みで追記する（イベントが先）

use async_trait::async_trait;

use crate::domain::{Event, EventDraft, JobId, JobRecord, StoreError};

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Version now stored for the job.
    pub version: u64,
    /// The appended events, with their sequence numbers.
    pub events: Vec<Event>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new job at version 1.
    async fn insert_job(&self, job: &JobRecord, events: &[EventDraft]) -> Result<Commit, StoreError>;

    async fn load_job(&self, job_id: JobId) -> Result<JobRecord, StoreError>;

    /// Jobs ordered by creation time (oldest first).
    async fn list_jobs(&self, include_terminal: bool) -> Result<Vec<JobRecord>, StoreError>;

    /// Atomically replaces the job if its stored version is still
    /// `expected_version`, appending `events` in the same write.
    ///
    /// Fails with `StoreError::VersionConflict` if another writer got there
    /// first; nothing is written in that case.
    async fn compare_and_swap(
        &self,
        job: &JobRecord,
        expected_version: u64,
        events: &[EventDraft],
    ) -> Result<Commit, StoreError>;

    /// All events of a job in sequence order.
    async fn events(&self, job_id: JobId) -> Result<Vec<Event>, StoreError>;
}
