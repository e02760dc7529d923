//! Lease - 作業単位の時間制限付き所有権
//!
//! 1 つの作業単位につき有効な lease は高々 1 つ。lease は job 集約の中に
//! 保存されるので、取得・延長・解放はすべて job の CAS で直列化されます。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, LeaseId, RunId, TaskId, WorkerId};

/// What a lease covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "unit", content = "task_id", rename_all = "snake_case")]
pub enum LeaseUnit {
    /// Decomposition of the whole job.
    Planning,
    Task(TaskId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub job_id: JobId,
    pub run_id: Option<RunId>,
    pub unit: LeaseUnit,
    pub worker: WorkerId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// Last time a heartbeat was written to the event log (throttled).
    pub heartbeat_logged_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// 期限切れ、またはハートビートが `stale_after` 以上途絶えている
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        !self.is_live(now) || now - self.heartbeat_at >= stale_after
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match &self.unit {
            LeaseUnit::Task(id) => Some(id),
            LeaseUnit::Planning => None,
        }
    }
}

/// Handle returned to a worker; proof of ownership for heartbeat/release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub id: LeaseId,
    pub job_id: JobId,
    pub unit: LeaseUnit,
    pub worker: WorkerId,
    pub expires_at: DateTime<Utc>,
}

impl From<&Lease> for LeaseToken {
    fn from(lease: &Lease) -> Self {
        Self {
            id: lease.id,
            job_id: lease.job_id,
            unit: lease.unit.clone(),
            worker: lease.worker.clone(),
            expires_at: lease.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn lease_at(now: DateTime<Utc>, ttl_secs: i64, last_beat_secs_ago: i64) -> Lease {
        Lease {
            id: LeaseId::from_ulid(Ulid::new()),
            job_id: JobId::from_ulid(Ulid::new()),
            run_id: None,
            unit: LeaseUnit::Task(TaskId::new("a")),
            worker: WorkerId::new("w1"),
            acquired_at: now - Duration::seconds(last_beat_secs_ago),
            expires_at: now + Duration::seconds(ttl_secs),
            heartbeat_at: now - Duration::seconds(last_beat_secs_ago),
            heartbeat_logged_at: now - Duration::seconds(last_beat_secs_ago),
        }
    }

    #[rstest]
    #[case::fresh(30, 0, false)]
    #[case::expired(-1, 0, true)]
    #[case::silent(30, 300, true)]
    #[case::almost_silent(30, 299, false)]
    fn staleness(#[case] ttl: i64, #[case] silent_for: i64, #[case] stale: bool) {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let lease = lease_at(now, ttl, silent_for);
        assert_eq!(lease.is_stale(now, Duration::seconds(300)), stale);
    }

    #[test]
    fn unit_serializes_with_task_id() {
        let value = serde_json::to_value(LeaseUnit::Task(TaskId::new("b"))).unwrap();
        assert_eq!(value, serde_json::json!({"unit": "task", "task_id": "b"}));
        let planning = serde_json::to_value(LeaseUnit::Planning).unwrap();
        assert_eq!(planning, serde_json::json!({"unit": "planning"}));
    }
}
