//! Submitter notifications.
//!
//! Email rendering and delivery live outside this service; the pipeline only
//! knows the `send(kind, report)` contract. The default implementation logs
//! the event so operators can trace what would have been delivered.

use async_trait::async_trait;
use tracing::info;

use crate::models::BugReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Confirmation,
    StatusUpdate,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Confirmation => "confirmation",
            NotificationKind::StatusUpdate => "status_update",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, kind: NotificationKind, report: &BugReport) -> Result<(), NotifyError>;
}

/// Hands the event to the logging pipeline; the mail service tails these.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, kind: NotificationKind, report: &BugReport) -> Result<(), NotifyError> {
        let Some(submitter) = &report.submitter else {
            // Anonymous submissions have nowhere to deliver to.
            return Ok(());
        };
        info!(
            kind = kind.as_str(),
            report = %report.external_id,
            submitter = %submitter.id,
            status = %report.status,
            "notification dispatched"
        );
        Ok(())
    }
}
