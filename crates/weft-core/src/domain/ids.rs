//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID
//! Job / Run / Lease はシステムが採番するので ULID を使います。
//! - 時刻でソート可能（作成順 = 辞書順）
//! - 分散生成可能（ワーカー間の調整が不要）
//!
//! `Id<T>` は Phantom type パターンで、`JobId` と `RunId` を
//! コンパイル時に区別します。
//!
//! # 文字列 ID
//! Task / Worker / Executor の ID は外部（decomposer・設定・運用者）が
//! 決めるので、newtype の文字列として扱います。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use ulid::Ulid;

/// 各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"job-", "run-", "lease-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// シリアライズ時は Display と同じ `"{prefix}{ulid}"` 形式の文字列になります。
#[repr(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

// derive だと `T: Clone` などの境界が付いてしまうので手書き
impl<T: IdMarker> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: IdMarker> Copy for Id<T> {}

impl<T: IdMarker> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ulid == other.ulid
    }
}

impl<T: IdMarker> Eq for Id<T> {}

impl<T: IdMarker> PartialOrd for Id<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: IdMarker> Ord for Id<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.ulid.cmp(&other.ulid)
    }
}

impl<T: IdMarker> std::hash::Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ulid.hash(state);
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

impl<T: IdMarker> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// ID 文字列のパースエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} id: {input:?}")]
pub struct ParseIdError {
    pub kind: &'static str,
    pub input: String,
}

impl<T: IdMarker> FromStr for Id<T> {
    type Err = ParseIdError;

    /// プレフィックス付き（"job-01H..."）でも素の ULID でも受け付ける
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw)
            .map(Self::from_ulid)
            .map_err(|_| ParseIdError {
                kind: T::prefix().trim_end_matches('-'),
                input: s.to_string(),
            })
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {}

impl IdMarker for Job {
    fn prefix() -> &'static str {
        "job-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lease {}

impl IdMarker for Lease {
    fn prefix() -> &'static str {
        "lease-"
    }
}

/// Identifier of a Job (submit/status/audit unit).
pub type JobId = Id<Job>;

/// Identifier of a Run (one execution attempt of a job's task set).
pub type RunId = Id<Run>;

/// Identifier of a Lease (one ownership claim on a unit of work).
pub type LeaseId = Id<Lease>;

// ========================================
// 文字列 ID
// ========================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Task identifier, declared by decomposition and stable within a job.
    TaskId
);
string_id!(
    /// Identity of a worker process holding leases.
    WorkerId
);
string_id!(
    /// Identity of the agent/executor a task is routed to.
    ExecutorId
);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn ids_are_distinct_types() {
        let ulid = Ulid::new();
        let job = JobId::from_ulid(ulid);
        let run = RunId::from_ulid(ulid);

        assert!(job.to_string().starts_with("job-"));
        assert!(run.to_string().starts_with("run-"));
        // let _: JobId = run; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = JobId::from_ulid(Ulid::from_parts(1_000, 7));
        let id2 = JobId::from_ulid(Ulid::from_parts(2_000, 1));
        assert!(id1 < id2);
    }

    #[test]
    fn ids_serialize_as_prefixed_strings() {
        let job_id = JobId::from_ulid(Ulid::new());
        let json = serde_json::to_string(&job_id).unwrap();
        assert_eq!(json, format!("\"{job_id}\""));

        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job_id);
    }

    #[rstest]
    #[case::prefixed(true)]
    #[case::bare(false)]
    fn parse_accepts_prefix_or_bare_ulid(#[case] with_prefix: bool) {
        let ulid = Ulid::new();
        let input = if with_prefix {
            format!("job-{ulid}")
        } else {
            ulid.to_string()
        };
        let parsed: JobId = input.parse().unwrap();
        assert_eq!(parsed.as_ulid(), ulid);
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "job-not-a-ulid".parse::<JobId>().unwrap_err();
        assert_eq!(err.kind, "job");
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        assert_eq!(std::mem::size_of::<JobId>(), std::mem::size_of::<Ulid>());
    }

    #[test]
    fn string_ids_are_transparent() {
        let task = TaskId::new("extract");
        assert_eq!(serde_json::to_string(&task).unwrap(), "\"extract\"");
        assert_eq!(task.to_string(), "extract");
    }
}
