#![cfg(feature = "inmem-store")]

use std::sync::{Arc, Mutex};

use bugrelay::github::{IssueRef, IssueState, IssueTracker, NewIssue, TrackerError};
use bugrelay::jobs::{
    run_create_issue, run_sync_status, JobContext, JobKind, JobQueue,
};
use bugrelay::models::*;
use bugrelay::notify::LogNotifier;
use bugrelay::repo::{inmem::InMemRepo, ReportRepo};
use chrono::Utc;
use serial_test::serial;

/// Records every tracker call; optionally fails them all.
#[derive(Default)]
struct StubTracker {
    created: Mutex<Vec<NewIssue>>,
    updates: Mutex<Vec<(u64, IssueState, Vec<String>)>>,
    fail: bool,
}

#[async_trait::async_trait]
impl IssueTracker for StubTracker {
    async fn create_issue(&self, issue: &NewIssue) -> Result<IssueRef, TrackerError> {
        if self.fail {
            return Err(TrackerError::Status(502));
        }
        self.created.lock().unwrap().push(issue.clone());
        Ok(IssueRef { number: 1234, url: "https://github.com/acme/app/issues/1234".into() })
    }
    async fn update_issue(
        &self,
        number: u64,
        state: IssueState,
        labels: Vec<String>,
    ) -> Result<(), TrackerError> {
        if self.fail {
            return Err(TrackerError::Status(502));
        }
        self.updates.lock().unwrap().push((number, state, labels));
        Ok(())
    }
    async fn add_comment(&self, _number: u64, _body: &str) -> Result<(), TrackerError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingQueue {
    jobs: Mutex<Vec<(JobKind, Id)>>,
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, kind: JobKind, report_id: Id) {
        self.jobs.lock().unwrap().push((kind, report_id));
    }
}

fn repo() -> Arc<InMemRepo> {
    std::env::set_var("BUGRELAY_DATA_DIR", tempfile::tempdir().unwrap().path());
    Arc::new(InMemRepo::new())
}

fn ctx(repo: Arc<InMemRepo>, tracker: Option<Arc<StubTracker>>) -> JobContext {
    JobContext {
        repo,
        tracker: tracker.map(|t| t as Arc<dyn IssueTracker>),
        notifier: Arc::new(LogNotifier),
    }
}

fn new_report(description: &str, score: Option<f64>, status: Status) -> NewBugReport {
    NewBugReport {
        external_id: format!("ext{:08}", next_suffix()),
        submitter: None,
        page_url: "https://example.com/dashboard".into(),
        description: description.into(),
        sanitized_description: Some(description.into()),
        title: Some("Export button fails".into()),
        category: Some("data".into()),
        severity: Some(Severity::High),
        quality_score: score,
        validation_result: serde_json::Value::Null,
        technical_context: TechnicalContext {
            browser: None,
            os: None,
            user_agent: None,
            viewport: None,
            timestamp: Utc::now(),
        },
        status,
    }
}

fn next_suffix() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

const GOOD_DESCRIPTION: &str =
    "The CSV export on the sales dashboard responds with a 500 whenever more than 50 rows are selected.";

#[tokio::test]
#[serial]
async fn low_quality_score_routes_to_rejected() {
    let repo = repo();
    let tracker = Arc::new(StubTracker::default());
    let context = ctx(repo.clone(), Some(tracker.clone()));
    let queue = RecordingQueue::default();

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(65.0), Status::Validated))
        .await
        .unwrap();

    run_create_issue(&context, &queue, report.id).await.unwrap();

    let report = repo.get(report.id).await.unwrap();
    assert_eq!(report.status, Status::Rejected);
    assert!(report
        .rejection_reason
        .as_deref()
        .unwrap()
        .contains("Quality score"));
    assert!(tracker.created.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn missing_quality_score_routes_to_rejected() {
    let repo = repo();
    let tracker = Arc::new(StubTracker::default());
    let context = ctx(repo.clone(), Some(tracker.clone()));
    let queue = RecordingQueue::default();

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, None, Status::Validated))
        .await
        .unwrap();

    run_create_issue(&context, &queue, report.id).await.unwrap();
    assert_eq!(repo.get(report.id).await.unwrap().status, Status::Rejected);
}

#[tokio::test]
#[serial]
async fn spam_at_publication_time_fails_revalidation() {
    let repo = repo();
    let tracker = Arc::new(StubTracker::default());
    let context = ctx(repo.clone(), Some(tracker.clone()));
    let queue = RecordingQueue::default();

    // Classified high but the stored text still trips the shared signature
    // table at execution time.
    let report = repo
        .create(new_report(
            "buy now click here free discount promo offer today",
            Some(90.0),
            Status::Validated,
        ))
        .await
        .unwrap();

    run_create_issue(&context, &queue, report.id).await.unwrap();

    let report = repo.get(report.id).await.unwrap();
    assert_eq!(report.status, Status::Rejected);
    assert_eq!(report.rejection_reason.as_deref(), Some("Failed re-validation check"));
    assert!(tracker.created.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn too_short_at_publication_time_fails_revalidation() {
    let repo = repo();
    let context = ctx(repo.clone(), Some(Arc::new(StubTracker::default())));
    let queue = RecordingQueue::default();

    let report = repo
        .create(new_report("broke somehow", Some(88.0), Status::Validated))
        .await
        .unwrap();

    run_create_issue(&context, &queue, report.id).await.unwrap();
    assert_eq!(repo.get(report.id).await.unwrap().status, Status::Rejected);
}

#[tokio::test]
#[serial]
async fn successful_publication_stores_issue_and_chains_confirmation() {
    let repo = repo();
    let tracker = Arc::new(StubTracker::default());
    let context = ctx(repo.clone(), Some(tracker.clone()));
    let queue = RecordingQueue::default();

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(85.0), Status::Validated))
        .await
        .unwrap();

    run_create_issue(&context, &queue, report.id).await.unwrap();

    let report = repo.get(report.id).await.unwrap();
    assert_eq!(report.status, Status::GithubCreated);
    assert_eq!(report.github_issue_number.as_deref(), Some("1234"));
    assert_eq!(
        report.github_issue_url.as_deref(),
        Some("https://github.com/acme/app/issues/1234")
    );
    assert_eq!(
        queue.jobs.lock().unwrap().as_slice(),
        &[(JobKind::SendConfirmation, report.id)]
    );

    let created = tracker.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert!(created[0].body.contains("## Technical Details"));
    assert!(created[0].labels.contains(&"bug-report".to_string()));
}

#[tokio::test]
#[serial]
async fn publication_is_idempotent() {
    let repo = repo();
    let tracker = Arc::new(StubTracker::default());
    let context = ctx(repo.clone(), Some(tracker.clone()));
    let queue = RecordingQueue::default();

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(85.0), Status::Validated))
        .await
        .unwrap();

    run_create_issue(&context, &queue, report.id).await.unwrap();
    run_create_issue(&context, &queue, report.id).await.unwrap();
    run_create_issue(&context, &queue, report.id).await.unwrap();

    assert_eq!(tracker.created.lock().unwrap().len(), 1);
    // Only the first run chained a confirmation.
    assert_eq!(queue.jobs.lock().unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn missing_report_is_a_noop() {
    let repo = repo();
    let context = ctx(repo.clone(), Some(Arc::new(StubTracker::default())));
    let queue = RecordingQueue::default();
    run_create_issue(&context, &queue, 9999).await.unwrap();
}

#[tokio::test]
#[serial]
async fn unpublishable_status_is_skipped_without_mutation() {
    let repo = repo();
    let tracker = Arc::new(StubTracker::default());
    let context = ctx(repo.clone(), Some(tracker.clone()));
    let queue = RecordingQueue::default();

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(85.0), Status::NeedsClarification))
        .await
        .unwrap();

    run_create_issue(&context, &queue, report.id).await.unwrap();

    let report = repo.get(report.id).await.unwrap();
    assert_eq!(report.status, Status::NeedsClarification);
    assert!(tracker.created.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn tracker_failure_leaves_report_validated_for_retry() {
    let repo = repo();
    let tracker = Arc::new(StubTracker { fail: true, ..StubTracker::default() });
    let context = ctx(repo.clone(), Some(tracker));
    let queue = RecordingQueue::default();

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(85.0), Status::Validated))
        .await
        .unwrap();

    let result = run_create_issue(&context, &queue, report.id).await;
    assert!(result.is_err());

    let report = repo.get(report.id).await.unwrap();
    // Never auto-rejected on transient failure; stays validated for manual
    // review once retries exhaust.
    assert_eq!(report.status, Status::Validated);
    assert!(report.github_issue_number.is_none());
    assert!(queue.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn missing_tracker_configuration_skips_without_error() {
    let repo = repo();
    let context = ctx(repo.clone(), None);
    let queue = RecordingQueue::default();

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(85.0), Status::Validated))
        .await
        .unwrap();

    run_create_issue(&context, &queue, report.id).await.unwrap();
    assert_eq!(repo.get(report.id).await.unwrap().status, Status::Validated);
}

#[tokio::test]
#[serial]
async fn sync_is_a_noop_without_an_issue() {
    let repo = repo();
    let tracker = Arc::new(StubTracker::default());
    let context = ctx(repo.clone(), Some(tracker.clone()));

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(85.0), Status::Validated))
        .await
        .unwrap();

    run_sync_status(&context, report.id).await.unwrap();
    assert!(tracker.updates.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn sync_pushes_resolved_state_as_closed() {
    let repo = repo();
    let tracker = Arc::new(StubTracker::default());
    let context = ctx(repo.clone(), Some(tracker.clone()));

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(85.0), Status::Validated))
        .await
        .unwrap();
    repo.set_issue(report.id, "77".into(), "https://github.com/acme/app/issues/77".into())
        .await
        .unwrap();
    repo.set_status(report.id, Status::Resolved, None).await.unwrap();

    run_sync_status(&context, report.id).await.unwrap();

    let updates = tracker.updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, 77);
    assert_eq!(updates[0].1, IssueState::Closed);
    assert!(updates[0].2.contains(&"severity:high".to_string()));
}

#[tokio::test]
#[serial]
async fn sync_failure_never_mutates_local_status() {
    let repo = repo();
    let tracker = Arc::new(StubTracker { fail: true, ..StubTracker::default() });
    let context = ctx(repo.clone(), Some(tracker));

    let report = repo
        .create(new_report(GOOD_DESCRIPTION, Some(85.0), Status::Validated))
        .await
        .unwrap();
    repo.set_issue(report.id, "77".into(), "https://github.com/acme/app/issues/77".into())
        .await
        .unwrap();
    repo.set_status(report.id, Status::Resolved, None).await.unwrap();

    assert!(run_sync_status(&context, report.id).await.is_err());
    assert_eq!(repo.get(report.id).await.unwrap().status, Status::Resolved);
}
