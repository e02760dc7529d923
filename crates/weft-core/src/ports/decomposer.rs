//! Decomposer port - goal を依存付きタスク列に分解する外部コラボレータ
//!
//! 自然言語の分解そのものはこのクレートの外にあります。
//! 返ってきた計画は graph builder が検証し、壊れていれば PlanningError に
//! なります（クラッシュはしない）。

use async_trait::async_trait;

use crate::domain::{JobId, TaskSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanningContext {
    pub job_id: JobId,
    pub project: String,
    /// Feedback from every `revise`, oldest first.
    pub feedback: Vec<String>,
    /// Plan that was rejected by the last `revise`, if any.
    pub previous_plan: Vec<TaskSpec>,
    /// 1 for the first planning attempt of this job.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecompositionError {
    #[error("decomposer unavailable: {0}")]
    Unavailable(String),

    #[error("malformed plan: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(
        &self,
        goal: &str,
        ctx: &PlanningContext,
    ) -> Result<Vec<TaskSpec>, DecompositionError>;
}
