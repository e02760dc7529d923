//! Notifier implementations.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::ports::{Notification, Notifier, NotifyError, Severity};

/// Writes notifications to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        let task = n.task_id.as_ref().map(|t| t.as_str()).unwrap_or("-");
        match n.severity {
            Severity::Info => info!(job_id = %n.job_id, task, kind = %n.kind, "notification"),
            Severity::Warn => warn!(job_id = %n.job_id, task, kind = %n.kind, "notification"),
            Severity::Error => error!(job_id = %n.job_id, task, kind = %n.kind, "notification"),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _n: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Keeps every notification in memory; can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records nothing and fails every call.
    pub fn failing() -> Self {
        Self {
            sent: Arc::default(),
            fail: true,
        }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError("channel unavailable".to_string()));
        }
        self.sent.lock().await.push(n.clone());
        Ok(())
    }
}
