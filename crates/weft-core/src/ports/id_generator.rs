//! IdGenerator port - ID 生成の抽象化
//!
//! Clock を使って現在時刻ベースの ULID を生成します。
//! テスト時に ManualClock / FixedClock を使えば timestamp 部分が決定的になります。

use crate::domain::ids::{IdMarker, JobId, LeaseId, RunId, Id};
use crate::ports::Clock;
use ulid::Ulid;

/// `Send + Sync` を要求（複数ワーカーから共有する）
pub trait IdGenerator: Send + Sync {
    fn generate_job_id(&self) -> JobId;

    fn generate_run_id(&self) -> RunId;

    fn generate_lease_id(&self) -> LeaseId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Id::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_job_id(&self) -> JobId {
        self.next()
    }

    fn generate_run_id(&self) -> RunId {
        self.next()
    }

    fn generate_lease_id(&self) -> LeaseId {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);
        let id1 = id_gen.generate_job_id();
        let id2 = id_gen.generate_job_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.generate_run_id();
        let id2 = id_gen.generate_run_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }

    #[test]
    fn prefixes_follow_id_kind() {
        let id_gen = UlidGenerator::new(SystemClock);
        assert!(id_gen.generate_job_id().to_string().starts_with("job-"));
        assert!(id_gen.generate_run_id().to_string().starts_with("run-"));
        assert!(id_gen.generate_lease_id().to_string().starts_with("lease-"));
    }
}
