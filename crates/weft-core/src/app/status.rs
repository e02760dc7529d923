//! Status - 複数のスナップショットから job の状態を解決する
//!
//! 優先順位は固定です:
//! 1. 最新 run のイベントログを畳み込んだ状態
//! 2. finalize 済みの run レコード
//! 3. job 行
//!
//! 食い違いは隠さずに `Resolution::Divergent` として返します。

use serde::Serialize;
use std::collections::BTreeMap;

use crate::domain::{
    Event, ExecutorId, FailureReport, JobId, JobRecord, JobStatus, RunId, TaskId, TaskStatus,
    fold_job_status,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Both sources are terminal and disagree.
    High,
    /// Exactly one source is terminal.
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    EventLog,
    RunRecord,
    JobRow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub source: Source,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    Resolved,
    Divergent {
        severity: Severity,
        sources: Vec<SourceStatus>,
        hint: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub executor: Option<ExecutorId>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionSummary {
    pub task_id: TaskId,
    pub question: String,
    pub question_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    /// Task count per status; only statuses that occur are listed.
    pub counts: BTreeMap<TaskStatus, usize>,
    pub tasks: Vec<TaskSummary>,
    pub current_run: Option<RunId>,
    pub runs: usize,
    pub audit_revision: u32,
    pub audit_decision: &'static str,
    pub pending_questions: Vec<QuestionSummary>,
    pub failures: Vec<FailureReport>,
    pub planning_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub job_id: JobId,
    pub goal: String,
    pub status: JobStatus,
    pub resolution: Resolution,
    pub summary: StatusSummary,
}

/// Resolves the status of `job` against its event log.
pub fn resolve(job: &JobRecord, events: &[Event]) -> StatusReport {
    let mut sources = Vec::with_capacity(3);
    if let Some(status) = fold_job_status(events, job.current_run) {
        sources.push(SourceStatus {
            source: Source::EventLog,
            status,
        });
    }
    if let Some(run) = job.current_run_record().filter(|r| r.status.is_final()) {
        sources.push(SourceStatus {
            source: Source::RunRecord,
            status: run.status.as_job_status(),
        });
    }
    sources.push(SourceStatus {
        source: Source::JobRow,
        status: job.status,
    });

    // 先頭が最も優先度の高いソース
    let status = sources[0].status;
    let resolution = divergence(&sources);

    StatusReport {
        job_id: job.id,
        goal: job.goal.clone(),
        status,
        resolution,
        summary: summarize(job),
    }
}

fn divergence(sources: &[SourceStatus]) -> Resolution {
    let mut worst: Option<Severity> = None;
    for (i, a) in sources.iter().enumerate() {
        for b in &sources[i + 1..] {
            if a.status == b.status {
                continue;
            }
            let severity = match (a.status.is_terminal(), b.status.is_terminal()) {
                (true, true) => Severity::High,
                (true, false) | (false, true) => Severity::Medium,
                (false, false) => Severity::Low,
            };
            worst = Some(match worst {
                Some(current) if rank(current) >= rank(severity) => current,
                _ => severity,
            });
        }
    }
    let Some(severity) = worst else {
        return Resolution::Resolved;
    };
    let described: Vec<String> = sources
        .iter()
        .map(|s| format!("{} says {}", source_name(s.source), s.status))
        .collect();
    let hint = format!(
        "{}; trusting {}. Inspect `events` for the job before acting on it.",
        described.join(", "),
        source_name(sources[0].source),
    );
    Resolution::Divergent {
        severity,
        sources: sources.to_vec(),
        hint,
    }
}

fn rank(severity: Severity) -> u8 {
    match severity {
        Severity::Low => 0,
        Severity::Medium => 1,
        Severity::High => 2,
    }
}

fn source_name(source: Source) -> &'static str {
    match source {
        Source::EventLog => "event log",
        Source::RunRecord => "run record",
        Source::JobRow => "job row",
    }
}

fn summarize(job: &JobRecord) -> StatusSummary {
    let mut counts = BTreeMap::new();
    for task in &job.tasks {
        *counts.entry(task.status).or_insert(0) += 1;
    }
    let tasks = job
        .tasks
        .iter()
        .map(|t| TaskSummary {
            id: t.id().clone(),
            status: t.status,
            attempts: t.attempts,
            executor: t.executor.clone(),
            last_error: t
                .last_error
                .as_ref()
                .map(|e| format!("{}: {}", e.class, e.message)),
        })
        .collect();
    let pending_questions = job
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::WaitingHuman)
        .filter_map(|t| {
            t.pending_question.as_ref().map(|q| QuestionSummary {
                task_id: t.id().clone(),
                question: q.question.clone(),
                question_hash: q.question_hash.clone(),
            })
        })
        .collect();
    StatusSummary {
        counts,
        tasks,
        current_run: job.current_run,
        runs: job.runs.len(),
        audit_revision: job.audit.revision,
        audit_decision: job.audit.latest.label(),
        pending_questions,
        failures: job.failures.clone(),
        planning_error: job.planning_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventDraft, EventKind, RunRecord, RunStatus};
    use chrono::Utc;
    use rstest::rstest;
    use ulid::Ulid;

    fn job_with_run(row: JobStatus, run: RunStatus) -> JobRecord {
        let now = Utc::now();
        let mut job = JobRecord::new(JobId::from_ulid(Ulid::new()), "g".into(), "p".into(), now);
        let run_id = RunId::from_ulid(Ulid::new());
        let mut record = RunRecord::start(run_id, now);
        if run.is_final() {
            record.finish(run, now);
        }
        job.runs.push(record);
        job.current_run = Some(run_id);
        job.status = row;
        job
    }

    fn log(job: &JobRecord, statuses: &[JobStatus]) -> Vec<Event> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, s)| {
                EventDraft::new(job.id, job.current_run, EventKind::RunStarted, Utc::now())
                    .job_status(*s)
                    .into_event(i as u64 + 1)
            })
            .collect()
    }

    #[test]
    fn agreeing_sources_resolve() {
        let job = job_with_run(JobStatus::Completed, RunStatus::Completed);
        let events = log(&job, &[JobStatus::Running, JobStatus::Completed]);
        let report = resolve(&job, &events);
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.resolution, Resolution::Resolved);
    }

    #[rstest]
    #[case::both_terminal(JobStatus::Completed, RunStatus::Failed, JobStatus::Failed, Severity::High)]
    #[case::one_terminal(JobStatus::Completed, RunStatus::Running, JobStatus::Running, Severity::Medium)]
    #[case::none_terminal(JobStatus::WaitingHuman, RunStatus::Running, JobStatus::Running, Severity::Low)]
    fn divergence_severity(
        #[case] logged: JobStatus,
        #[case] run: RunStatus,
        #[case] row: JobStatus,
        #[case] expected: Severity,
    ) {
        let job = job_with_run(row, run);
        let events = log(&job, &[JobStatus::Running, logged]);
        let report = resolve(&job, &events);

        // イベントログが最優先
        assert_eq!(report.status, logged);
        match report.resolution {
            Resolution::Divergent { severity, hint, .. } => {
                assert_eq!(severity, expected);
                assert!(hint.contains("trusting event log"));
            }
            Resolution::Resolved => panic!("expected divergence"),
        }
    }

    #[test]
    fn run_record_wins_over_row_without_events() {
        let job = job_with_run(JobStatus::Running, RunStatus::Failed);
        let report = resolve(&job, &[]);
        assert_eq!(report.status, JobStatus::Failed);
        assert!(matches!(
            report.resolution,
            Resolution::Divergent { severity: Severity::Medium, .. }
        ));
    }

    #[test]
    fn summary_lists_pending_questions() {
        use crate::domain::{PendingQuestion, TaskRecord, TaskSpec};
        let now = Utc::now();
        let mut job = JobRecord::new(JobId::from_ulid(Ulid::new()), "g".into(), "p".into(), now);
        let mut task = TaskRecord::new(TaskSpec::new("a", &[]), 0, now);
        task.status = TaskStatus::WaitingHuman;
        task.pending_question = Some(PendingQuestion {
            question: "Which region?".into(),
            question_hash: "0123456789ab".into(),
            asked_at: now,
        });
        job.tasks.push(task);

        let report = resolve(&job, &[]);
        assert_eq!(report.summary.pending_questions.len(), 1);
        assert_eq!(report.summary.counts.get(&TaskStatus::WaitingHuman), Some(&1));
    }
}
