//! Background jobs: publication, tracker status sync, notifications.
//!
//! The queue is in-process: an unbounded channel drained by a single worker
//! task. Delivery is at-least-once and strictly sequential, which also gives
//! the per-report serialization the publication job relies on (no two
//! attempts for the same report ever overlap). A failed job is re-sent with
//! a quadratic backoff until its retry bound is exhausted, then abandoned
//! with the report left in its last good status for manual review.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::fallback;
use crate::github::{issue_content, issue_labels, IssueState, IssueTracker, TrackerError};
use crate::models::{Id, Status, StatusActor};
use crate::notify::{NotificationKind, Notifier, NotifyError};
use crate::repo::{RepoError, ReportRepo};

/// Reports scoring below this never become public issues.
pub const MIN_QUALITY_SCORE_FOR_PUBLISH: f64 = 70.0;

/// Minimum description length the publication-time re-check accepts.
pub const REVALIDATION_MIN_CHARS: usize = 20;

/// Automatic retries after the first failed attempt.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    CreateIssue,
    SyncStatus,
    SendConfirmation,
    SendStatusUpdate,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::CreateIssue => "create_issue",
            JobKind::SyncStatus => "sync_status",
            JobKind::SendConfirmation => "send_confirmation",
            JobKind::SendStatusUpdate => "send_status_update",
        }
    }
}

/// Fire-and-forget queueing interface consumed by the orchestrator, the
/// operator routes, and the jobs themselves (for chaining).
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, kind: JobKind, report_id: Id);
}

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Everything a job needs besides the report id.
#[derive(Clone)]
pub struct JobContext {
    pub repo: Arc<dyn ReportRepo>,
    pub tracker: Option<Arc<dyn IssueTracker>>,
    pub notifier: Arc<dyn Notifier>,
}

struct Envelope {
    kind: JobKind,
    report_id: Id,
    attempt: u32,
    tag: Uuid,
}

#[derive(Clone)]
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl InProcessQueue {
    /// Spawns the worker task and returns the queue handle. Must be called
    /// from within a tokio runtime.
    pub fn start(ctx: JobContext) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self { tx });
        tokio::spawn(worker_loop(ctx, queue.clone(), rx));
        queue
    }
}

impl JobQueue for InProcessQueue {
    fn enqueue(&self, kind: JobKind, report_id: Id) {
        let envelope = Envelope {
            kind,
            report_id,
            attempt: 0,
            tag: Uuid::new_v4(),
        };
        // The worker lives as long as the process; a closed channel only
        // happens during shutdown, where dropping the job is fine.
        if self.tx.send(envelope).is_err() {
            warn!("job queue is shut down; dropping {} for report {report_id}", kind.as_str());
        }
    }
}

async fn worker_loop(
    ctx: JobContext,
    queue: Arc<InProcessQueue>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(env) = rx.recv().await {
        let result = run_job(&ctx, queue.as_ref(), env.kind, env.report_id).await;
        match result {
            Ok(()) => {}
            Err(e) if env.attempt < MAX_RETRIES => {
                let attempt = env.attempt + 1;
                let backoff_ms = 200 * u64::from(attempt.pow(2));
                warn!(
                    job = env.kind.as_str(),
                    report = env.report_id,
                    tag = %env.tag,
                    attempt,
                    "job failed, retrying in {backoff_ms}ms: {e}"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                let _ = queue.tx.send(Envelope { attempt, ..env });
            }
            Err(e) => {
                metrics::increment_counter!("bugrelay_jobs_abandoned_total");
                error!(
                    job = env.kind.as_str(),
                    report = env.report_id,
                    tag = %env.tag,
                    "job abandoned after {MAX_RETRIES} retries: {e}"
                );
            }
        }
    }
}

pub async fn run_job(
    ctx: &JobContext,
    queue: &dyn JobQueue,
    kind: JobKind,
    report_id: Id,
) -> Result<(), JobError> {
    match kind {
        JobKind::CreateIssue => run_create_issue(ctx, queue, report_id).await,
        JobKind::SyncStatus => run_sync_status(ctx, report_id).await,
        JobKind::SendConfirmation => {
            run_notification(ctx, NotificationKind::Confirmation, report_id).await
        }
        JobKind::SendStatusUpdate => {
            run_notification(ctx, NotificationKind::StatusUpdate, report_id).await
        }
    }
}

/// Publication job. Idempotent: a no-op when the report is gone, deleted, or
/// already has an issue. Quality and spam are re-checked at execution time
/// because classification and publication are temporally separated.
pub async fn run_create_issue(
    ctx: &JobContext,
    queue: &dyn JobQueue,
    report_id: Id,
) -> Result<(), JobError> {
    let report = match ctx.repo.get(report_id).await {
        Ok(r) => r,
        Err(RepoError::NotFound) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if report.github_issue_created() || report.deleted_at.is_some() {
        return Ok(());
    }
    if !report
        .status
        .can_transition(Status::GithubCreated, StatusActor::Publisher)
    {
        warn!(
            report = %report.external_id,
            status = %report.status,
            "report is not in a publishable state; skipping"
        );
        return Ok(());
    }

    metrics::increment_counter!("bugrelay_publish_attempts_total");

    // Gate 1: quality threshold.
    let meets_threshold = report
        .quality_score
        .map(|s| s >= MIN_QUALITY_SCORE_FOR_PUBLISH)
        .unwrap_or(false);
    if !meets_threshold {
        warn!(
            report = %report.external_id,
            score = ?report.quality_score,
            "rejected for publication: quality score below {MIN_QUALITY_SCORE_FOR_PUBLISH}"
        );
        metrics::increment_counter!("bugrelay_publish_rejected_total");
        ctx.repo
            .set_status(
                report.id,
                Status::Rejected,
                Some("Quality score too low for public issue".into()),
            )
            .await?;
        return Ok(());
    }

    // Gate 2: spam re-check against the same signature table the fallback
    // classifier uses.
    let text = fallback::normalize(report.publishable_description());
    let spam = fallback::matches_spam_signature(&text);
    if text.chars().count() < REVALIDATION_MIN_CHARS || spam.is_some() {
        warn!(
            report = %report.external_id,
            signature = ?spam,
            "rejected for publication: failed re-validation"
        );
        metrics::increment_counter!("bugrelay_publish_rejected_total");
        ctx.repo
            .set_status(report.id, Status::Rejected, Some("Failed re-validation check".into()))
            .await?;
        return Ok(());
    }

    let Some(tracker) = &ctx.tracker else {
        warn!(
            report = %report.external_id,
            "no issue tracker configured; report stays validated"
        );
        return Ok(());
    };

    let issue = tracker.create_issue(&issue_content(&report)).await.map_err(|e| {
        metrics::increment_counter!("bugrelay_publish_failures_total");
        e
    })?;

    ctx.repo
        .set_issue(report.id, issue.number.to_string(), issue.url.clone())
        .await?;
    ctx.repo.set_status(report.id, Status::GithubCreated, None).await?;
    info!(
        report = %report.external_id,
        issue = issue.number,
        "published report to tracker"
    );
    queue.enqueue(JobKind::SendConfirmation, report.id);
    Ok(())
}

/// One-directional sync of local status to the tracker. Never mutates local
/// state; failures are logged and retried only by the queue's default bound.
pub async fn run_sync_status(ctx: &JobContext, report_id: Id) -> Result<(), JobError> {
    let report = match ctx.repo.get(report_id).await {
        Ok(r) => r,
        Err(RepoError::NotFound) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let Some(number) = report
        .github_issue_number
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
    else {
        return Ok(());
    };
    let Some(tracker) = &ctx.tracker else { return Ok(()) };

    let state = if report.status == Status::Resolved {
        IssueState::Closed
    } else {
        IssueState::Open
    };
    tracker.update_issue(number, state, issue_labels(&report)).await?;
    Ok(())
}

async fn run_notification(
    ctx: &JobContext,
    kind: NotificationKind,
    report_id: Id,
) -> Result<(), JobError> {
    let report = match ctx.repo.get(report_id).await {
        Ok(r) => r,
        Err(RepoError::NotFound) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    ctx.notifier.send(kind, &report).await?;
    Ok(())
}
