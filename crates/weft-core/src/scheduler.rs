//! Scheduler: which tasks of a job may be dispatched right now.
//!
//! The eligible set is recomputed from task statuses every time, never kept
//! as a separate queue, so replaying a completion cannot double-admit a task.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{JobRecord, OrchestratorError, TaskId, TaskSpec, TaskStatus};
use crate::graph::ExecutionGraph;

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    max_parallel_tasks: usize,
}

impl Scheduler {
    pub fn new(max_parallel_tasks: usize) -> Self {
        Self { max_parallel_tasks }
    }

    pub fn max_parallel_tasks(&self) -> usize {
        self.max_parallel_tasks
    }

    /// Rebuilds the graph of a job from its stored task specs.
    pub fn graph_for(job: &JobRecord) -> Result<ExecutionGraph, OrchestratorError> {
        let specs: Vec<TaskSpec> = job.tasks.iter().map(|t| t.spec.clone()).collect();
        Ok(ExecutionGraph::build(&specs)?)
    }

    /// Tasks that may be dispatched now, in declared order.
    ///
    /// A task is eligible when the job is executable and approved, the task is
    /// pending and out of backoff, every parent is completed, and the job's
    /// in-flight count leaves room under `max_parallel_tasks`.
    pub fn eligible(&self, job: &JobRecord, graph: &ExecutionGraph, now: DateTime<Utc>) -> Vec<TaskId> {
        if !job.status.is_executable() || !job.audit.permits_dispatch() {
            return Vec::new();
        }
        let slots = self.max_parallel_tasks.saturating_sub(job.in_flight_count());
        if slots == 0 {
            debug!(job_id = %job.id, in_flight = job.in_flight_count(), "no free slots");
            return Vec::new();
        }

        let is_completed = |id: &TaskId| {
            job.task(id)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        };

        // roots plus every child whose parents have all completed
        let mut candidates: Vec<TaskId> = graph.ready().to_vec();
        for done in job.tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            candidates.extend(graph.unlocked_by(done.id(), is_completed));
        }

        let mut tasks: Vec<_> = job
            .tasks
            .iter()
            .filter(|t| candidates.contains(t.id()))
            .filter(|t| t.status == TaskStatus::Pending && t.is_due(now))
            .collect();
        tasks.sort_by_key(|t| t.order);
        tasks.into_iter().take(slots).map(|t| t.id().clone()).collect()
    }

    /// Pending tasks downstream of a terminally failed task.
    pub fn unreachable(job: &JobRecord, graph: &ExecutionGraph) -> Vec<TaskId> {
        let mut out: Vec<TaskId> = Vec::new();
        for failed in job
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Unreachable))
        {
            for descendant in graph.descendants(failed.id()) {
                let pending = job
                    .task(&descendant)
                    .is_some_and(|t| t.status == TaskStatus::Pending);
                if pending && !out.contains(&descendant) {
                    out.push(descendant);
                }
            }
        }
        out
    }

    /// True when some non-terminal task could still make progress without
    /// a human answer.
    pub fn can_progress(job: &JobRecord, graph: &ExecutionGraph) -> bool {
        if job.tasks.iter().any(|t| t.status.is_in_flight()) {
            return true;
        }
        let mut blocked: Vec<TaskId> = Vec::new();
        for stuck in job
            .tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed && t.status != TaskStatus::Pending)
        {
            blocked.extend(graph.descendants(stuck.id()));
        }
        job.tasks
            .iter()
            .any(|t| t.status == TaskStatus::Pending && !blocked.contains(t.id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AuditDecision, JobId, JobStatus, TaskRecord};
    use rstest::rstest;
    use ulid::Ulid;

    fn job_with(specs: &[TaskSpec], status: JobStatus, approved: bool) -> JobRecord {
        let now = Utc::now();
        let mut job = JobRecord::new(JobId::from_ulid(Ulid::new()), "g".into(), "p".into(), now);
        job.status = status;
        if approved {
            job.audit.record(AuditDecision::Approve, now);
        }
        job.tasks = specs
            .iter()
            .enumerate()
            .map(|(i, s)| TaskRecord::new(s.clone(), i, now))
            .collect();
        job
    }

    fn set(job: &mut JobRecord, id: &str, status: TaskStatus) {
        job.task_mut(&TaskId::new(id)).unwrap().status = status;
    }

    fn fan_out() -> Vec<TaskSpec> {
        vec![
            TaskSpec::new("a", &[]),
            TaskSpec::new("b", &["a"]),
            TaskSpec::new("c", &["a"]),
        ]
    }

    #[test]
    fn only_roots_are_eligible_initially() {
        let job = job_with(&fan_out(), JobStatus::Running, true);
        let graph = Scheduler::graph_for(&job).unwrap();
        let eligible = Scheduler::new(4).eligible(&job, &graph, Utc::now());
        assert_eq!(eligible, vec![TaskId::new("a")]);
    }

    #[test]
    fn completion_admits_children_in_declared_order_up_to_ceiling() {
        let mut job = job_with(&fan_out(), JobStatus::Running, true);
        set(&mut job, "a", TaskStatus::Completed);
        let graph = Scheduler::graph_for(&job).unwrap();

        let one = Scheduler::new(1).eligible(&job, &graph, Utc::now());
        assert_eq!(one, vec![TaskId::new("b")]);

        set(&mut job, "b", TaskStatus::Dispatched);
        assert!(Scheduler::new(1).eligible(&job, &graph, Utc::now()).is_empty());
        assert_eq!(
            Scheduler::new(2).eligible(&job, &graph, Utc::now()),
            vec![TaskId::new("c")]
        );
    }

    #[test]
    fn join_is_admitted_only_after_every_parent_completes() {
        let specs = vec![
            TaskSpec::new("a", &[]),
            TaskSpec::new("b", &[]),
            TaskSpec::new("join", &["a", "b"]),
        ];
        let mut job = job_with(&specs, JobStatus::Running, true);
        set(&mut job, "a", TaskStatus::Completed);
        set(&mut job, "b", TaskStatus::Running);
        let graph = Scheduler::graph_for(&job).unwrap();
        assert!(Scheduler::new(4).eligible(&job, &graph, Utc::now()).is_empty());

        set(&mut job, "b", TaskStatus::Completed);
        let first = Scheduler::new(4).eligible(&job, &graph, Utc::now());
        assert_eq!(first, vec![TaskId::new("join")]);
        // asking again admits nothing new
        assert_eq!(Scheduler::new(4).eligible(&job, &graph, Utc::now()), first);
    }

    #[rstest]
    #[case::awaiting_audit(JobStatus::AwaitingAudit, true)]
    #[case::not_approved(JobStatus::Running, false)]
    #[case::waiting_human(JobStatus::WaitingHuman, true)]
    #[case::cancelled(JobStatus::Cancelled, true)]
    fn nothing_is_eligible_outside_executable_approved_jobs(
        #[case] status: JobStatus,
        #[case] approved: bool,
    ) {
        let job = job_with(&fan_out(), status, approved);
        let graph = Scheduler::graph_for(&job).unwrap();
        assert!(Scheduler::new(4).eligible(&job, &graph, Utc::now()).is_empty());
    }

    #[test]
    fn backoff_delays_eligibility() {
        let now = Utc::now();
        let mut job = job_with(&fan_out(), JobStatus::Running, true);
        job.task_mut(&TaskId::new("a")).unwrap().not_before = Some(now + chrono::Duration::seconds(2));
        let graph = Scheduler::graph_for(&job).unwrap();
        assert!(Scheduler::new(4).eligible(&job, &graph, now).is_empty());
        assert_eq!(
            Scheduler::new(4).eligible(&job, &graph, now + chrono::Duration::seconds(2)),
            vec![TaskId::new("a")]
        );
    }

    #[test]
    fn failure_makes_descendants_unreachable() {
        let mut specs = fan_out();
        specs.push(TaskSpec::new("d", &["b"]));
        specs.push(TaskSpec::new("e", &[]));
        let mut job = job_with(&specs, JobStatus::Running, true);
        set(&mut job, "a", TaskStatus::Completed);
        set(&mut job, "b", TaskStatus::Failed);
        let graph = Scheduler::graph_for(&job).unwrap();
        assert_eq!(Scheduler::unreachable(&job, &graph), vec![TaskId::new("d")]);
    }

    #[test]
    fn waiting_sibling_does_not_stop_progress() {
        let specs = vec![
            TaskSpec::new("a", &[]),
            TaskSpec::new("b", &[]),
            TaskSpec::new("c", &["a"]),
            TaskSpec::new("d", &["c"]),
        ];
        let mut job = job_with(&specs, JobStatus::Running, true);
        set(&mut job, "a", TaskStatus::WaitingHuman);
        let graph = Scheduler::graph_for(&job).unwrap();
        assert!(Scheduler::can_progress(&job, &graph));
        assert_eq!(
            Scheduler::new(2).eligible(&job, &graph, Utc::now()),
            vec![TaskId::new("b")]
        );

        set(&mut job, "b", TaskStatus::Completed);
        assert!(!Scheduler::can_progress(&job, &graph));
    }
}
