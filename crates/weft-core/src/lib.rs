//! weft-core
//!
//! Job orchestration core: goal → 依存付きタスク計画 → 人間の audit →
//! lease ベースの並行実行 → 失敗分類と回復 → human-in-the-loop の再開。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, job, audit, lease, outcome, decision, events, errors）
//! - **graph**: 依存グラフの構築と検証
//! - **scheduler**: いま dispatch してよいタスクの算出
//! - **machine**: job / task の状態機械（遷移とイベント生成）
//! - **routing**: capability → executor のルーティング表
//! - **config**: 設定（TOML + `WEFT_*` 環境変数）
//! - **ports**: 抽象化レイヤー（JobStore, Clock, IdGenerator, Decomposer, Executor, Notifier）
//! - **impls**: ports の実装（in-memory / SQLite ストア、通知、スクリプト化されたコラボレータ）
//! - **app**: アプリケーションロジック（builder, orchestrator, coordinator, worker_loop, status）

pub mod app;
pub mod config;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod machine;
pub mod ports;
pub mod routing;
pub mod scheduler;

pub use app::{Orchestrator, OrchestratorBuilder, ResumeAck, StatusReport, Worker, WorkerGroup};
pub use config::{ConfigError, OrchestratorConfig};
pub use domain::{JobId, JobStatus, OrchestratorError, TaskId, TaskSpec, TaskStatus};
