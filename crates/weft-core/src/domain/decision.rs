//! Decision model: what to do with a task after a failed attempt.
//!
//! The `Decider` is pure: given the failure and the attempt count it returns
//! the next action. Applying that action (rescheduling, marking the task
//! failed, pausing for a human) is the state machine's job.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ids::TaskId;
use super::outcome::{ErrorClass, FailureKind};
use super::retry::RetryPolicy;

/// User-facing description of a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub task_id: TaskId,
    pub root_cause: ErrorClass,
    pub message: String,
    /// Re-running the job unchanged may succeed.
    pub retry_safe: bool,
    pub next_action: String,
}

impl FailureReport {
    pub fn new(task_id: TaskId, root_cause: ErrorClass, message: impl Into<String>) -> Self {
        let retry_safe = root_cause.kind() == FailureKind::Transient;
        let next_action = recommended_action(&root_cause).to_string();
        Self {
            task_id,
            root_cause,
            message: message.into(),
            retry_safe,
            next_action,
        }
    }
}

fn recommended_action(class: &ErrorClass) -> &'static str {
    match class {
        ErrorClass::Timeout => "check executor capacity or raise dispatch_timeout, then resubmit",
        ErrorClass::RateLimited => "wait for the rate limit window to reset, then resubmit",
        ErrorClass::Unavailable => "check that the executor is up, then resubmit",
        ErrorClass::Network => "check connectivity to the executor, then resubmit",
        ErrorClass::OutputMissing => "make the executor write every declared output",
        ErrorClass::SchemaMismatch => "fix the task's input/output schema and revise the plan",
        ErrorClass::InvalidConfig => "fix the executor configuration before resubmitting",
        ErrorClass::MissingInput { .. } => "answer the pending question with `resume`",
        ErrorClass::Internal => "inspect the executor logs; this will repeat until fixed",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Put the task back to pending after `delay`.
    Retry { delay: Duration, reason: String },

    /// Give up on the task.
    FailTerminal { report: FailureReport },

    /// Pause the task until an operator answers `question`.
    EscalateHuman { question: String },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Retry { .. } => "retry",
            Decision::FailTerminal { .. } => "fail_terminal",
            Decision::EscalateHuman { .. } => "escalate_human",
        }
    }
}

/// Decides the next action for a failed attempt.
pub trait Decider: Send + Sync {
    /// `attempts` counts the attempt that just failed.
    fn decide(
        &self,
        task_id: &TaskId,
        class: &ErrorClass,
        message: &str,
        attempts: u32,
        max_attempts: u32,
    ) -> Decision;
}

/// Default classifier.
///
/// - deterministic classes are never retried
/// - missing input escalates to a human regardless of attempts
/// - transient classes retry with backoff until `max_attempts`
#[derive(Debug, Clone, Default)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

impl Decider for DefaultDecider {
    fn decide(
        &self,
        task_id: &TaskId,
        class: &ErrorClass,
        message: &str,
        attempts: u32,
        max_attempts: u32,
    ) -> Decision {
        if let ErrorClass::MissingInput { question } = class {
            return Decision::EscalateHuman {
                question: question.clone(),
            };
        }
        match class.kind() {
            FailureKind::Deterministic | FailureKind::Human => Decision::FailTerminal {
                report: FailureReport::new(task_id.clone(), class.clone(), message),
            },
            FailureKind::Transient if attempts >= max_attempts => Decision::FailTerminal {
                report: FailureReport::new(
                    task_id.clone(),
                    class.clone(),
                    format!("{message} (max attempts reached: {attempts}/{max_attempts})"),
                ),
            },
            FailureKind::Transient => {
                let delay = self.retry_policy.next_delay(attempts);
                Decision::Retry {
                    delay,
                    reason: format!(
                        "retry attempt {}/{} after {:?}: {class}",
                        attempts + 1,
                        max_attempts,
                        delay
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decide(class: ErrorClass, attempts: u32) -> Decision {
        DefaultDecider::default().decide(&TaskId::new("t"), &class, "boom", attempts, 3)
    }

    #[rstest]
    #[case::schema(ErrorClass::SchemaMismatch)]
    #[case::config(ErrorClass::InvalidConfig)]
    #[case::internal(ErrorClass::Internal)]
    fn deterministic_failures_are_never_retried(#[case] class: ErrorClass) {
        match decide(class, 1) {
            Decision::FailTerminal { report } => assert!(!report.retry_safe),
            other => panic!("expected FailTerminal, got {other:?}"),
        }
    }

    #[rstest]
    #[case::timeout(ErrorClass::Timeout)]
    #[case::rate_limited(ErrorClass::RateLimited)]
    #[case::network(ErrorClass::Network)]
    fn transient_failures_retry_until_ceiling(#[case] class: ErrorClass) {
        assert!(matches!(decide(class.clone(), 1), Decision::Retry { .. }));
        assert!(matches!(decide(class.clone(), 2), Decision::Retry { .. }));
        match decide(class, 3) {
            Decision::FailTerminal { report } => {
                assert!(report.retry_safe);
                assert!(report.message.contains("3/3"));
            }
            other => panic!("expected FailTerminal, got {other:?}"),
        }
    }

    #[test]
    fn retry_delay_follows_policy() {
        let Decision::Retry { delay, .. } = decide(ErrorClass::Timeout, 2) else {
            panic!("expected retry");
        };
        assert_eq!(delay, Duration::from_secs(4));
    }

    #[test]
    fn missing_input_escalates_even_at_ceiling() {
        let class = ErrorClass::MissingInput {
            question: "Which account?".into(),
        };
        assert_eq!(
            decide(class, 3),
            Decision::EscalateHuman {
                question: "Which account?".into()
            }
        );
    }

    #[test]
    fn report_carries_one_next_action() {
        let report = FailureReport::new(TaskId::new("t"), ErrorClass::SchemaMismatch, "bad");
        assert!(report.next_action.contains("revise"));
    }
}
