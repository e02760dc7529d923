//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **OrchestratorBuilder**: ワイヤリングと起動時検証
//! - **Orchestrator**: オペレータ向けの操作（submit / approve / revise / cancel / resume / status）
//! - **Coordinator**: lease と CAS によるワーカー協調
//! - **Worker / WorkerGroup**: recover → plan → claim → execute → release のループ
//! - **status**: 複数ソースからの状態解決

pub mod builder;
pub mod coordinator;
pub mod orchestrator;
pub mod status;
pub mod worker_loop;

pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::coordinator::{Claim, Coordinator, PlanningClaim, Released};
pub use self::orchestrator::{Orchestrator, ResumeAck};
pub use self::status::{Resolution, Severity, StatusReport};
pub use self::worker_loop::{TickReport, Worker, WorkerGroup};
