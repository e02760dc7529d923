//! libSQL (SQLite) JobStore.
//!
//! Layout:
//! - `jobs`: one row per job aggregate (JSON body) plus a `version` column
//!   for compare-and-swap, and `status`/`created_at` for listing.
//! - `events`: append-only log keyed by an autoincrement sequence, indexed
//!   by `(job_id, sequence)` and `(run_id, ts)`.
//!
//! Every write runs in an IMMEDIATE transaction: events are inserted first,
//! then the guarded `UPDATE ... WHERE version = ?`. If the guard matches no
//! row the transaction is rolled back and nothing is visible.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{Event, EventDraft, JobId, JobRecord, StoreError};
use crate::ports::{Commit, JobStore};

const SCHEMA: &str = r#"
    PRAGMA busy_timeout = 5000;
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
    CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at, id);

    CREATE TABLE IF NOT EXISTS events (
        sequence INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        run_id TEXT,
        task_id TEXT,
        kind TEXT NOT NULL,
        ts TEXT NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_job ON events(job_id, sequence);
    CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, ts);
"#;

pub struct SqliteJobStore {
    /// `conn` was opened from this database; dropping it closes the file.
    _db: Arc<LibSqlDatabase>,
    /// Serialises transactions issued from this process; other processes
    /// are kept out by SQLite's own locking.
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) a local database file and create the schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("creating database directory: {e}")))?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(backend("opening database"))?;
        let store = Self::with_database(db).await?;
        info!(path = %path.display(), "job store opened");
        Ok(store)
    }

    /// In-memory database (for tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(backend("opening in-memory database"))?;
        Self::with_database(db).await
    }

    async fn with_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db.connect().map_err(backend("connecting"))?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(backend("creating schema"))?;
        Ok(Self {
            _db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn backend(context: &'static str) -> impl Fn(libsql::Error) -> StoreError {
    move |e| StoreError::Backend(format!("{context}: {e}"))
}

fn timestamp(at: DateTime<Utc>) -> String {
    // 固定幅なので文字列比較 = 時刻比較
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(format!("encoding: {e}")))
}

fn decode_job(body: &str, version: i64) -> Result<JobRecord, StoreError> {
    let mut job: JobRecord =
        serde_json::from_str(body).map_err(|e| StoreError::Corrupt(format!("job body: {e}")))?;
    job.version = u64::try_from(version).unwrap_or_default();
    Ok(job)
}

async fn insert_events(conn: &Connection, drafts: &[EventDraft]) -> Result<Vec<Event>, StoreError> {
    let mut out = Vec::with_capacity(drafts.len());
    for draft in drafts {
        conn.execute(
            "INSERT INTO events (job_id, run_id, task_id, kind, ts, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                draft.job_id.to_string(),
                opt_text(draft.run_id.map(|r| r.to_string())),
                opt_text(draft.task_id.as_ref().map(|t| t.to_string())),
                draft.kind.as_str(),
                timestamp(draft.timestamp),
                encode(draft)?,
            ],
        )
        .await
        .map_err(backend("insert_event"))?;
        let sequence = u64::try_from(conn.last_insert_rowid()).unwrap_or_default();
        out.push(draft.clone().into_event(sequence));
    }
    Ok(out)
}

async fn stored_version(conn: &Connection, job_id: JobId) -> Result<Option<u64>, StoreError> {
    let mut rows = conn
        .query("SELECT version FROM jobs WHERE id = ?1", params![job_id.to_string()])
        .await
        .map_err(backend("stored_version"))?;
    match rows.next().await {
        Ok(Some(row)) => {
            let version = row.get::<i64>(0).map_err(backend("stored_version row"))?;
            Ok(Some(u64::try_from(version).unwrap_or_default()))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(backend("stored_version")(e)),
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: &JobRecord, events: &[EventDraft]) -> Result<Commit, StoreError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(backend("begin"))?;

        if stored_version(&tx, job.id).await?.is_some() {
            tx.rollback().await.map_err(backend("rollback"))?;
            return Err(StoreError::AlreadyExists(job.id));
        }
        let appended = insert_events(&tx, events).await?;

        let mut stored = job.clone();
        stored.version = 1;
        tx.execute(
            "INSERT INTO jobs (id, status, created_at, updated_at, version, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.to_string(),
                job.status.as_str(),
                timestamp(job.created_at),
                timestamp(job.updated_at),
                1_i64,
                encode(&stored)?,
            ],
        )
        .await
        .map_err(backend("insert_job"))?;
        tx.commit().await.map_err(backend("commit"))?;

        debug!(job_id = %job.id, events = appended.len(), "job inserted");
        Ok(Commit {
            version: 1,
            events: appended,
        })
    }

    async fn load_job(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT body, version FROM jobs WHERE id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(backend("load_job"))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let body = row.get::<String>(0).map_err(backend("load_job row"))?;
                let version = row.get::<i64>(1).map_err(backend("load_job row"))?;
                decode_job(&body, version)
            }
            Ok(None) => Err(StoreError::NotFound(job_id)),
            Err(e) => Err(backend("load_job")(e)),
        }
    }

    async fn list_jobs(&self, include_terminal: bool) -> Result<Vec<JobRecord>, StoreError> {
        let sql = if include_terminal {
            "SELECT body, version FROM jobs ORDER BY created_at, id"
        } else {
            "SELECT body, version FROM jobs WHERE status NOT IN ('completed', 'failed', 'cancelled') ORDER BY created_at, id"
        };
        let conn = self.conn.lock().await;
        let mut rows = conn.query(sql, ()).await.map_err(backend("list_jobs"))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(backend("list_jobs"))? {
            let body = row.get::<String>(0).map_err(backend("list_jobs row"))?;
            let version = row.get::<i64>(1).map_err(backend("list_jobs row"))?;
            match decode_job(&body, version) {
                Ok(job) => jobs.push(job),
                Err(e) => tracing::warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn compare_and_swap(
        &self,
        job: &JobRecord,
        expected_version: u64,
        events: &[EventDraft],
    ) -> Result<Commit, StoreError> {
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(backend("begin"))?;

        let appended = insert_events(&tx, events).await?;

        let version = expected_version + 1;
        let mut stored = job.clone();
        stored.version = version;
        let changed = tx
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2, version = ?3, body = ?4 WHERE id = ?5 AND version = ?6",
                params![
                    job.status.as_str(),
                    timestamp(job.updated_at),
                    version as i64,
                    encode(&stored)?,
                    job.id.to_string(),
                    expected_version as i64,
                ],
            )
            .await
            .map_err(backend("compare_and_swap"))?;

        if changed == 0 {
            let actual = stored_version(&tx, job.id).await?;
            tx.rollback().await.map_err(backend("rollback"))?;
            return Err(match actual {
                Some(actual) => StoreError::VersionConflict {
                    job_id: job.id,
                    expected: expected_version,
                    actual,
                },
                None => StoreError::NotFound(job.id),
            });
        }
        tx.commit().await.map_err(backend("commit"))?;
        Ok(Commit {
            version,
            events: appended,
        })
    }

    async fn events(&self, job_id: JobId) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT sequence, body FROM events WHERE job_id = ?1 ORDER BY sequence",
                params![job_id.to_string()],
            )
            .await
            .map_err(backend("events"))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(backend("events"))? {
            let sequence = row.get::<i64>(0).map_err(backend("events row"))?;
            let body = row.get::<String>(1).map_err(backend("events row"))?;
            let draft: EventDraft = serde_json::from_str(&body)
                .map_err(|e| StoreError::Corrupt(format!("event body: {e}")))?;
            events.push(draft.into_event(u64::try_from(sequence).unwrap_or_default()));
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventKind, JobStatus, TaskId, TaskRecord, TaskSpec};
    use ulid::Ulid;

    fn job() -> JobRecord {
        let now = Utc::now();
        let mut job = JobRecord::new(JobId::from_ulid(Ulid::new()), "goal".into(), "proj".into(), now);
        job.tasks.push(TaskRecord::new(TaskSpec::new("a", &[]), 0, now));
        job
    }

    #[tokio::test]
    async fn roundtrips_job_and_events_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("weft.db");
        let job = job();
        {
            let store = SqliteJobStore::open(&path).await.unwrap();
            let draft = EventDraft::new(job.id, None, EventKind::JobSubmitted, Utc::now())
                .job_status(JobStatus::Submitted);
            store.insert_job(&job, &[draft]).await.unwrap();
        }

        let store = SqliteJobStore::open(&path).await.unwrap();
        let loaded = store.load_job(job.id).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.task(&TaskId::new("a")).unwrap().order, 0);

        let events = store.events(job.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::JobSubmitted);
        assert!(events[0].sequence >= 1);
    }

    #[tokio::test]
    async fn conflicting_swap_rolls_back_events() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let mut job = job();
        store.insert_job(&job, &[]).await.unwrap();

        job.status = JobStatus::Planning;
        let ok = store
            .compare_and_swap(
                &job,
                1,
                &[EventDraft::new(job.id, None, EventKind::PlanningStarted, Utc::now())],
            )
            .await
            .unwrap();
        assert_eq!(ok.version, 2);

        let err = store
            .compare_and_swap(
                &job,
                1,
                &[EventDraft::new(job.id, None, EventKind::PlanReady, Utc::now())],
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::VersionConflict {
                job_id: job.id,
                expected: 1,
                actual: 2,
            }
        );
        let kinds: Vec<EventKind> = store
            .events(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EventKind::PlanningStarted]);
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let id = JobId::from_ulid(Ulid::new());
        assert_eq!(store.load_job(id).await.unwrap_err(), StoreError::NotFound(id));
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let job = job();
        store.insert_job(&job, &[]).await.unwrap();
        assert_eq!(
            store.insert_job(&job, &[]).await.unwrap_err(),
            StoreError::AlreadyExists(job.id)
        );
    }

    #[tokio::test]
    async fn list_filters_terminal_jobs() {
        let store = SqliteJobStore::open_in_memory().await.unwrap();
        let mut done = job();
        done.status = JobStatus::Cancelled;
        store.insert_job(&done, &[]).await.unwrap();
        let open = job();
        store.insert_job(&open, &[]).await.unwrap();

        let active = store.list_jobs(false).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, open.id);
        assert_eq!(store.list_jobs(true).await.unwrap().len(), 2);
    }
}
