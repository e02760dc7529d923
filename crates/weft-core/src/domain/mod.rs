//! Domain model (IDs, states, records, outcomes, decisions, events).
//!
//! ここにあるのは純粋なデータと判定ロジックだけで、I/O は持ちません。

pub mod audit;
pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod job;
pub mod lease;
pub mod outcome;
pub mod question;
pub mod retry;
pub mod run;
pub mod state;
pub mod task;

pub use audit::{AuditDecision, AuditEntry, AuditRecord};
pub use decision::{Decider, Decision, DefaultDecider, FailureReport};
pub use errors::{OrchestratorError, PlanningError, StoreError};
pub use events::{Event, EventDraft, EventKind, fold_job_status};
pub use ids::{ExecutorId, JobId, LeaseId, ParseIdError, RunId, TaskId, WorkerId};
pub use job::JobRecord;
pub use lease::{Lease, LeaseToken, LeaseUnit};
pub use outcome::{ErrorClass, ExecutionOutcome, FailureKind, Outputs};
pub use question::{normalize_question, question_hash};
pub use retry::RetryPolicy;
pub use run::{RunRecord, RunStatus};
pub use state::{JobStatus, TaskStatus};
pub use task::{HumanInput, PendingQuestion, TaskError, TaskRecord, TaskSpec};
