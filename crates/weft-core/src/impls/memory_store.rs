//! In-memory JobStore.
//!
//! One `tokio::sync::Mutex` guards jobs and events together, which is what
//! makes `compare_and_swap` atomic. Used by tests and by single-process runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Event, EventDraft, JobId, JobRecord, StoreError};
use crate::ports::{Commit, JobStore};

#[derive(Default)]
struct InMemoryState {
    jobs: HashMap<JobId, JobRecord>,
    events: Vec<Event>,
    next_sequence: u64,
}

impl InMemoryState {
    fn append(&mut self, drafts: &[EventDraft]) -> Vec<Event> {
        let appended: Vec<Event> = drafts
            .iter()
            .cloned()
            .map(|draft| {
                self.next_sequence += 1;
                draft.into_event(self.next_sequence)
            })
            .collect();
        self.events.extend(appended.iter().cloned());
        appended
    }
}

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_job(&self, job: &JobRecord, events: &[EventDraft]) -> Result<Commit, StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        // イベントを先に書く
        let events = state.append(events);
        let mut stored = job.clone();
        stored.version = 1;
        state.jobs.insert(job.id, stored);
        Ok(Commit { version: 1, events })
    }

    async fn load_job(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn list_jobs(&self, include_terminal: bool) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|j| include_terminal || !j.status.is_terminal())
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    async fn compare_and_swap(
        &self,
        job: &JobRecord,
        expected_version: u64,
        events: &[EventDraft],
    ) -> Result<Commit, StoreError> {
        let mut state = self.state.lock().await;
        let actual = state
            .jobs
            .get(&job.id)
            .map(|j| j.version)
            .ok_or(StoreError::NotFound(job.id))?;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                job_id: job.id,
                expected: expected_version,
                actual,
            });
        }
        let events = state.append(events);
        let version = expected_version + 1;
        let mut stored = job.clone();
        stored.version = version;
        state.jobs.insert(job.id, stored);
        Ok(Commit { version, events })
    }

    async fn events(&self, job_id: JobId) -> Result<Vec<Event>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, JobStatus};
    use chrono::Utc;
    use ulid::Ulid;

    fn job() -> JobRecord {
        JobRecord::new(JobId::from_ulid(Ulid::new()), "g".into(), "p".into(), Utc::now())
    }

    fn draft(job: &JobRecord, kind: EventKind) -> EventDraft {
        EventDraft::new(job.id, None, kind, Utc::now())
    }

    #[tokio::test]
    async fn insert_then_load_starts_at_version_one() {
        let store = InMemoryJobStore::new();
        let job = job();
        let commit = store
            .insert_job(&job, &[draft(&job, EventKind::JobSubmitted)])
            .await
            .unwrap();
        assert_eq!(commit.version, 1);
        assert_eq!(commit.events[0].sequence, 1);
        assert_eq!(store.load_job(job.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn stale_version_is_rejected_and_writes_nothing() {
        let store = InMemoryJobStore::new();
        let mut job = job();
        store.insert_job(&job, &[]).await.unwrap();

        job.status = JobStatus::Planning;
        store
            .compare_and_swap(&job, 1, &[draft(&job, EventKind::PlanningStarted)])
            .await
            .unwrap();

        let err = store
            .compare_and_swap(&job, 1, &[draft(&job, EventKind::PlanReady)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 1, actual: 2, .. }));
        assert_eq!(store.events(job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_hides_terminal_jobs_unless_asked() {
        let store = InMemoryJobStore::new();
        let mut done = job();
        done.status = JobStatus::Completed;
        store.insert_job(&done, &[]).await.unwrap();
        store.insert_job(&job(), &[]).await.unwrap();

        assert_eq!(store.list_jobs(false).await.unwrap().len(), 1);
        assert_eq!(store.list_jobs(true).await.unwrap().len(), 2);
    }
}
