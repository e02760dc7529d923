//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。永続化・時刻・ID 採番・
//! 外部コラボレータ（decomposer / executor / notifier）はすべて trait 越しに
//! 使い、実装は `impls` か呼び出し側のクレートが提供します。

pub mod clock;
pub mod decomposer;
pub mod executor;
pub mod id_generator;
pub mod job_store;
pub mod notifier;

pub use self::clock::{Clock, FixedClock, ManualClock, SystemClock};
pub use self::decomposer::{Decomposer, DecompositionError, PlanningContext};
pub use self::executor::{ExecutionRequest, Executor};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::{Commit, JobStore};
pub use self::notifier::{Notification, Notifier, NotifyError, Severity};
