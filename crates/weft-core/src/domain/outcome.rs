//! Execution outcome and error classes.
//!
//! Executors report failures as data (`ErrorClass` + message) rather than as
//! Rust errors: a failing task is a normal event in the life of a job.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Root-cause class of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The dispatch (or the whole job) exceeded its time budget.
    Timeout,
    RateLimited,
    Unavailable,
    Network,
    /// The executor returned without producing a declared output.
    OutputMissing,
    SchemaMismatch,
    InvalidConfig,
    /// The executor cannot proceed without an answer from a human.
    MissingInput { question: String },
    /// Unexpected executor-side failure (bug, panic, unknown exit).
    Internal,
}

/// How the classifier treats an error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying as-is.
    Transient,
    /// Retrying the same input will fail again.
    Deterministic,
    /// Needs a human answer before it can go on.
    Human,
}

impl ErrorClass {
    pub fn kind(&self) -> FailureKind {
        match self {
            ErrorClass::Timeout
            | ErrorClass::RateLimited
            | ErrorClass::Unavailable
            | ErrorClass::Network
            | ErrorClass::OutputMissing => FailureKind::Transient,
            ErrorClass::SchemaMismatch | ErrorClass::InvalidConfig | ErrorClass::Internal => {
                FailureKind::Deterministic
            }
            ErrorClass::MissingInput { .. } => FailureKind::Human,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Unavailable => "unavailable",
            ErrorClass::Network => "network",
            ErrorClass::OutputMissing => "output_missing",
            ErrorClass::SchemaMismatch => "schema_mismatch",
            ErrorClass::InvalidConfig => "invalid_config",
            ErrorClass::MissingInput { .. } => "missing_input",
            ErrorClass::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Named outputs produced by a successful execution.
pub type Outputs = BTreeMap<String, serde_json::Value>;

/// What an executor reports back for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        #[serde(default)]
        outputs: Outputs,
    },
    Failure {
        class: ErrorClass,
        message: String,
    },
}

impl ExecutionOutcome {
    pub fn success(outputs: Outputs) -> Self {
        ExecutionOutcome::Success { outputs }
    }

    pub fn failure(class: ErrorClass, message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            class,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }

    /// Checks that every declared output is present and non-empty.
    ///
    /// A success that misses a declared output is downgraded to an
    /// `OutputMissing` failure, which the classifier treats as transient.
    pub fn verify_outputs(self, required: &[String]) -> Self {
        let ExecutionOutcome::Success { outputs } = &self else {
            return self;
        };
        for name in required {
            match outputs.get(name) {
                None => {
                    return ExecutionOutcome::failure(
                        ErrorClass::OutputMissing,
                        format!("required output '{name}' was not produced"),
                    );
                }
                Some(value) if is_empty_value(value) => {
                    return ExecutionOutcome::failure(
                        ErrorClass::OutputMissing,
                        format!("required output '{name}' is empty"),
                    );
                }
                Some(_) => {}
            }
        }
        self
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::timeout(ErrorClass::Timeout, FailureKind::Transient)]
    #[case::rate_limited(ErrorClass::RateLimited, FailureKind::Transient)]
    #[case::output_missing(ErrorClass::OutputMissing, FailureKind::Transient)]
    #[case::schema(ErrorClass::SchemaMismatch, FailureKind::Deterministic)]
    #[case::config(ErrorClass::InvalidConfig, FailureKind::Deterministic)]
    #[case::missing_input(ErrorClass::MissingInput { question: "which?".into() }, FailureKind::Human)]
    fn classes_map_to_kinds(#[case] class: ErrorClass, #[case] kind: FailureKind) {
        assert_eq!(class.kind(), kind);
    }

    #[test]
    fn missing_output_downgrades_success() {
        let outcome = ExecutionOutcome::success(Outputs::from([("a".to_string(), json!("x"))]));
        let verified = outcome.verify_outputs(&["a".to_string(), "b".to_string()]);
        assert!(matches!(
            verified,
            ExecutionOutcome::Failure { class: ErrorClass::OutputMissing, .. }
        ));
    }

    #[test]
    fn blank_output_counts_as_missing() {
        let outcome = ExecutionOutcome::success(Outputs::from([("a".to_string(), json!("  "))]));
        assert!(!outcome.verify_outputs(&["a".to_string()]).is_success());
    }

    #[test]
    fn complete_outputs_pass_through() {
        let outcome = ExecutionOutcome::success(Outputs::from([("a".to_string(), json!(1))]));
        assert!(outcome.verify_outputs(&["a".to_string()]).is_success());
    }

    #[test]
    fn failure_keeps_question_in_class() {
        let outcome = ExecutionOutcome::failure(
            ErrorClass::MissingInput {
                question: "Which region?".into(),
            },
            "need region",
        );
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["kind"], "failure");
        assert_eq!(value["class"]["missing_input"]["question"], "Which region?");
        let back: ExecutionOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(back, outcome);
    }
}
