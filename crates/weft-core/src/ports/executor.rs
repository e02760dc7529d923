//! Executor port - タスクを実際に実行するエージェント
//!
//! 失敗は `ExecutionOutcome::Failure` として返します（Result ではない）。
//! timeout は呼び出し側（worker）が `tokio::time::timeout` でも強制するので、
//! 実装側が守らなくても hang はしません。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::{
    ExecutionOutcome, ExecutorId, HumanInput, JobId, Outputs, RunId, TaskId, TaskSpec,
};

/// Everything an executor gets to see for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub job_id: JobId,
    pub run_id: Option<RunId>,
    pub goal: String,
    pub project: String,
    pub task: TaskSpec,
    pub executor: ExecutorId,
    /// 1 for the first dispatch of this task.
    pub attempt: u32,
    /// Outputs of completed parent tasks.
    pub upstream_outputs: BTreeMap<TaskId, Outputs>,
    /// Operator answers collected while the task waited for a human.
    pub human_inputs: Vec<HumanInput>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest, timeout: Duration) -> ExecutionOutcome;
}
