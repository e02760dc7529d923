//! Audit record - 計画と実行の間にある人間の判断
//!
//! 最新の決定が `Approve` のときだけ dispatch を許可します。
//! 許可フラグは保存せず、常に `latest` から導出します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuditDecision {
    /// 計画直後、まだ誰も判断していない
    Pending,
    Approve,
    Revise { feedback: String },
    Cancel,
}

impl AuditDecision {
    pub fn label(&self) -> &'static str {
        match self {
            AuditDecision::Pending => "pending",
            AuditDecision::Approve => "approve",
            AuditDecision::Revise { .. } => "revise",
            AuditDecision::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub revision: u32,
    pub decision: AuditDecision,
    pub decided_at: DateTime<Utc>,
}

/// Versioned audit record of a job.
///
/// `revision` increments on every decision and on every new plan, so a
/// decision always refers to exactly one plan generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub revision: u32,
    pub latest: AuditDecision,
    pub history: Vec<AuditEntry>,
}

impl AuditRecord {
    pub fn new() -> Self {
        Self {
            revision: 0,
            latest: AuditDecision::Pending,
            history: Vec::new(),
        }
    }

    pub fn permits_dispatch(&self) -> bool {
        matches!(self.latest, AuditDecision::Approve)
    }

    pub fn record(&mut self, decision: AuditDecision, now: DateTime<Utc>) {
        self.revision += 1;
        self.history.push(AuditEntry {
            revision: self.revision,
            decision: decision.clone(),
            decided_at: now,
        });
        self.latest = decision;
    }

    /// 新しい計画ができたら判断は未決に戻る
    pub fn reset_for_new_plan(&mut self, now: DateTime<Utc>) {
        self.record(AuditDecision::Pending, now);
    }

    /// 過去の revise で渡された feedback（古い順）
    pub fn feedback_history(&self) -> Vec<String> {
        self.history
            .iter()
            .filter_map(|e| match &e.decision {
                AuditDecision::Revise { feedback } => Some(feedback.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Default for AuditRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::pending(AuditDecision::Pending, false)]
    #[case::approve(AuditDecision::Approve, true)]
    #[case::revise(AuditDecision::Revise { feedback: "split step 2".into() }, false)]
    #[case::cancel(AuditDecision::Cancel, false)]
    fn only_approve_permits_dispatch(#[case] decision: AuditDecision, #[case] permits: bool) {
        let mut audit = AuditRecord::new();
        audit.record(decision, Utc::now());
        assert_eq!(audit.permits_dispatch(), permits);
    }

    #[test]
    fn revise_after_approve_revokes_permission() {
        let now = Utc::now();
        let mut audit = AuditRecord::new();
        audit.record(AuditDecision::Approve, now);
        audit.record(
            AuditDecision::Revise {
                feedback: "more tests".into(),
            },
            now,
        );
        assert!(!audit.permits_dispatch());
        assert_eq!(audit.revision, 2);
        assert_eq!(audit.feedback_history(), vec!["more tests".to_string()]);
    }
}
