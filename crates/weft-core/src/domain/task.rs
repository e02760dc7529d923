//! Task specification and the task row kept inside a job aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::ids::{ExecutorId, TaskId};
use super::outcome::{ErrorClass, Outputs};
use super::state::TaskStatus;

/// A task as declared by decomposition.
///
/// `deps` refer to other tasks of the same plan; the graph builder
/// rejects unknown references and cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub deps: Vec<TaskId>,
    /// Input names the executor expects to receive.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Output names the executor must produce for the task to count as completed.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Routing key, resolved to an executor by the capability registry.
    #[serde(default = "default_capability")]
    pub capability: String,
}

fn default_capability() -> String {
    "general".to_string()
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, deps: &[&str]) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            deps: deps.iter().map(|d| TaskId::new(*d)).collect(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            capability: default_capability(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|o| o.to_string()).collect();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// An operator answer to a task's question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanInput {
    pub question: String,
    pub question_hash: String,
    pub answer: String,
    pub answered_at: DateTime<Utc>,
}

/// A question the task is currently blocked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub question: String,
    pub question_hash: String,
    pub asked_at: DateTime<Utc>,
}

/// Task row inside a job aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub spec: TaskSpec,
    pub status: TaskStatus,
    /// Position in the plan; ties in scheduling are broken by it.
    pub order: usize,
    pub executor: Option<ExecutorId>,
    pub attempts: u32,
    pub last_error: Option<TaskError>,
    /// Earliest time a retry may be dispatched.
    pub not_before: Option<DateTime<Utc>>,
    pub outputs: Outputs,
    pub pending_question: Option<PendingQuestion>,
    #[serde(default)]
    pub human_inputs: Vec<HumanInput>,
    /// Hashes of this task's questions whose answer has been consumed.
    #[serde(default)]
    pub consumed_questions: BTreeSet<String>,
    /// How many times this task was pulled back from a stale lease.
    #[serde(default)]
    pub stale_recoveries: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: ErrorClass,
    pub message: String,
}

impl TaskRecord {
    pub fn new(spec: TaskSpec, order: usize, now: DateTime<Utc>) -> Self {
        Self {
            spec,
            status: TaskStatus::Pending,
            order,
            executor: None,
            attempts: 0,
            last_error: None,
            not_before: None,
            outputs: Outputs::new(),
            pending_question: None,
            human_inputs: Vec::new(),
            consumed_questions: BTreeSet::new(),
            stale_recoveries: 0,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.spec.id
    }

    /// Backoff 中でなければ dispatch 可能
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_fill_missing_fields() {
        let spec: TaskSpec = serde_json::from_str(r#"{"id":"a"}"#).unwrap();
        assert_eq!(spec.capability, "general");
        assert!(spec.deps.is_empty());
        assert!(spec.outputs.is_empty());
    }

    #[test]
    fn due_respects_backoff() {
        let now = Utc::now();
        let mut record = TaskRecord::new(TaskSpec::new("a", &[]), 0, now);
        assert!(record.is_due(now));

        record.not_before = Some(now + chrono::Duration::seconds(5));
        assert!(!record.is_due(now));
        assert!(record.is_due(now + chrono::Duration::seconds(5)));
    }
}
