//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryJobStore**: テスト・単一プロセス用の正本
//! - **SqliteJobStore**: libsql (SQLite) による永続的な正本
//! - **LogNotifier / NoopNotifier / RecordingNotifier**: 通知
//! - **ScriptedExecutor / StaticDecomposer**: シナリオを再生するコラボレータ

pub mod memory_store;
pub mod notifier;
pub mod scripted;
pub mod sqlite_store;

pub use self::memory_store::InMemoryJobStore;
pub use self::notifier::{LogNotifier, NoopNotifier, RecordingNotifier};
pub use self::scripted::{Call, ScriptedExecutor, StaticDecomposer, Step};
pub use self::sqlite_store::SqliteJobStore;
