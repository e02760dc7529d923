//! Scripted collaborators for tests and dry runs.
//!
//! `ScriptedExecutor` plays back per-task outcomes; `StaticDecomposer`
//! plays back plans. Both record what they were asked.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ExecutionOutcome, Outputs, TaskId, TaskSpec};
use crate::ports::{
    Decomposer, DecompositionError, ExecutionRequest, Executor, PlanningContext,
};

#[derive(Debug, Clone)]
pub enum Step {
    Return(ExecutionOutcome),
    /// Wait, then return.
    Delay(Duration, ExecutionOutcome),
    /// Never returns; the caller's timeout has to fire.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub task_id: TaskId,
    pub attempt: u32,
}

#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    scripts: Arc<Mutex<HashMap<TaskId, VecDeque<Step>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `steps` for `task`; once they run out the task succeeds.
    pub async fn script(&self, task: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .await
            .entry(TaskId::new(task))
            .or_default()
            .extend(steps);
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, task: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.task_id.as_str() == task)
            .count()
    }

    /// Highest number of executions that overlapped.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn default_success(task: &TaskSpec) -> ExecutionOutcome {
        let outputs: Outputs = task
            .outputs
            .iter()
            .map(|name| (name.clone(), serde_json::json!(format!("{}:{name}", task.id))))
            .collect();
        ExecutionOutcome::success(outputs)
    }
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest, _timeout: Duration) -> ExecutionOutcome {
        self.calls.lock().await.push(Call {
            task_id: request.task.id.clone(),
            attempt: request.attempt,
        });
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(Arc::clone(&self.running));

        let step = self
            .scripts
            .lock()
            .await
            .get_mut(&request.task.id)
            .and_then(VecDeque::pop_front);
        match step {
            Some(Step::Return(outcome)) => outcome,
            Some(Step::Delay(delay, outcome)) => {
                tokio::time::sleep(delay).await;
                outcome
            }
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                Self::default_success(&request.task)
            }
            None => Self::default_success(&request.task),
        }
    }
}

/// Hands out queued plans in order; repeats the last successful one.
#[derive(Clone, Default)]
pub struct StaticDecomposer {
    plans: Arc<Mutex<VecDeque<Result<Vec<TaskSpec>, DecompositionError>>>>,
    last: Arc<Mutex<Option<Vec<TaskSpec>>>>,
    contexts: Arc<Mutex<Vec<PlanningContext>>>,
}

impl StaticDecomposer {
    pub fn new(plan: Vec<TaskSpec>) -> Self {
        let this = Self::default();
        if let Ok(mut last) = this.last.try_lock() {
            *last = Some(plan);
        }
        this
    }

    pub async fn push(&self, result: Result<Vec<TaskSpec>, DecompositionError>) {
        self.plans.lock().await.push_back(result);
    }

    pub async fn contexts(&self) -> Vec<PlanningContext> {
        self.contexts.lock().await.clone()
    }
}

#[async_trait]
impl Decomposer for StaticDecomposer {
    async fn decompose(
        &self,
        _goal: &str,
        ctx: &PlanningContext,
    ) -> Result<Vec<TaskSpec>, DecompositionError> {
        self.contexts.lock().await.push(ctx.clone());
        let next = self.plans.lock().await.pop_front();
        match next {
            Some(Ok(plan)) => {
                *self.last.lock().await = Some(plan.clone());
                Ok(plan)
            }
            Some(Err(e)) => Err(e),
            None => self
                .last
                .lock()
                .await
                .clone()
                .ok_or_else(|| DecompositionError::Unavailable("no plan scripted".into())),
        }
    }
}
