#![cfg(feature = "inmem-store")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bugrelay::classifier::ValidatorStack;
use bugrelay::jobs::{JobKind, JobQueue};
use bugrelay::models::{Id, Status, Submitter};
use bugrelay::redactor::{Redactor, SanitizationConfig};
use bugrelay::repo::{inmem::InMemRepo, ReportRepo};
use bugrelay::storage::{AttachmentStore, StoreError};
use bugrelay::submission::{
    Screenshot, SubmissionOutcome, SubmissionParams, SubmissionService,
};
use serial_test::serial;

#[derive(Default)]
struct MemStore {
    inner: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

#[async_trait::async_trait]
impl AttachmentStore for MemStore {
    async fn save(&self, key: &str, mime: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), (bytes.to_vec(), mime.to_string()));
        Ok(())
    }
    async fn load(&self, key: &str) -> Result<(Vec<u8>, String), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Store that always fails; submissions must survive it.
struct BrokenStore;

#[async_trait::async_trait]
impl AttachmentStore for BrokenStore {
    async fn save(&self, _: &str, _: &str, _: &[u8]) -> Result<(), StoreError> {
        Err(StoreError::Other("disk on fire".into()))
    }
    async fn load(&self, _: &str) -> Result<(Vec<u8>, String), StoreError> {
        Err(StoreError::NotFound)
    }
    async fn delete(&self, _: &str) -> Result<(), StoreError> {
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

struct Fixture {
    repo: Arc<InMemRepo>,
    store: Arc<MemStore>,
    queue: Arc<RecordingQueue>,
    service: SubmissionService,
}

fn fixture() -> Fixture {
    std::env::set_var("BUGRELAY_DATA_DIR", tempfile::tempdir().unwrap().path());
    let repo = Arc::new(InMemRepo::new());
    let store = Arc::new(MemStore::default());
    let queue = Arc::new(RecordingQueue::default());
    let service = SubmissionService::new(
        repo.clone(),
        Arc::new(ValidatorStack::fallback_only()),
        Redactor::new(SanitizationConfig::builtin()),
        store.clone(),
        queue.clone(),
    );
    Fixture { repo, store, queue, service }
}

const VALID_DESCRIPTION: &str = "Clicking the 'Export CSV' button on the sales dashboard throws a 500 error; happens every time with more than 50 rows selected.";

fn valid_params() -> SubmissionParams {
    SubmissionParams {
        description: VALID_DESCRIPTION.into(),
        page_url: Some("https://example.com/dashboard".into()),
        browser: Some("Chrome 126".into()),
        os: Some("macOS".into()),
        viewport: Some("1440x900".into()),
        ..SubmissionParams::default()
    }
}

fn tiny_png() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([120, 40, 200, 255]));
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[tokio::test]
#[serial]
async fn vague_report_is_stored_as_needs_clarification() {
    let f = fixture();
    let outcome = f
        .service
        .submit(SubmissionParams {
            description: "It doesn't work".into(),
            page_url: Some("https://example.com/dashboard".into()),
            ..SubmissionParams::default()
        })
        .await
        .unwrap();

    let SubmissionOutcome::Accepted { report, verdict } = outcome else {
        panic!("expected accepted outcome");
    };
    assert_eq!(report.status, Status::NeedsClarification);
    assert!(verdict.needs_clarification);
    assert!(verdict.clarification_message.is_some());
    // Clarification blocks publication: nothing was enqueued.
    assert!(f.queue.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn valid_report_is_validated_and_enqueued_for_publication() {
    let f = fixture();
    let outcome = f.service.submit(valid_params()).await.unwrap();

    let SubmissionOutcome::Accepted { report, verdict } = outcome else {
        panic!("expected accepted outcome");
    };
    assert_eq!(report.status, Status::Validated);
    assert!(verdict.quality_score.unwrap() >= 70.0);
    assert_eq!(
        f.queue.jobs.lock().unwrap().as_slice(),
        &[(JobKind::CreateIssue, report.id)]
    );
    // The raw verdict snapshot is persisted for audit.
    assert_eq!(report.validation_result["valid"], serde_json::json!(true));
}

#[tokio::test]
#[serial]
async fn spam_report_is_rejected_without_a_record() {
    let f = fixture();
    let outcome = f
        .service
        .submit(SubmissionParams {
            description: "buy now click here free discount".into(),
            ..SubmissionParams::default()
        })
        .await
        .unwrap();

    let SubmissionOutcome::Rejected { verdict } = outcome else {
        panic!("expected rejection");
    };
    assert!(verdict.rejection_reason.is_some());
    assert!(f.repo.list_recent(true).await.unwrap().is_empty());
    assert!(f.queue.jobs.lock().unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn external_ids_are_assigned_once_and_unique() {
    let f = fixture();
    let mut ids = Vec::new();
    for _ in 0..5 {
        let outcome = f.service.submit(valid_params()).await.unwrap();
        let SubmissionOutcome::Accepted { report, .. } = outcome else {
            panic!("expected accepted outcome");
        };
        assert_eq!(report.external_id.len(), 12);
        assert!(report
            .external_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        ids.push(report.external_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

#[tokio::test]
#[serial]
async fn checkout_screenshot_is_blurred_with_metadata() {
    let f = fixture();
    let png = tiny_png();
    let outcome = f
        .service
        .submit(SubmissionParams {
            description: VALID_DESCRIPTION.into(),
            page_url: Some("https://example.com/checkout".into()),
            screenshot: Some(Screenshot { bytes: png.clone(), content_type: "image/png".into() }),
            ..SubmissionParams::default()
        })
        .await
        .unwrap();

    let SubmissionOutcome::Accepted { report, .. } = outcome else {
        panic!("expected accepted outcome");
    };
    let meta = report.blur_metadata.expect("blur metadata recorded");
    assert!(meta.blurred_patterns.iter().any(|p| p == "email_addresses"));

    let original_key = report.screenshot_original.expect("original attached");
    let sanitized_key = report.screenshot_sanitized.expect("sanitized attached");
    let (original, _) = f.store.load(&original_key).await.unwrap();
    let (sanitized, _) = f.store.load(&sanitized_key).await.unwrap();
    assert_eq!(original, png);
    assert_ne!(sanitized, png);
}

#[tokio::test]
#[serial]
async fn product_screenshot_passes_through_unchanged() {
    let f = fixture();
    let png = tiny_png();
    let outcome = f
        .service
        .submit(SubmissionParams {
            description: VALID_DESCRIPTION.into(),
            page_url: Some("https://example.com/p/ebook".into()),
            screenshot: Some(Screenshot { bytes: png.clone(), content_type: "image/png".into() }),
            ..SubmissionParams::default()
        })
        .await
        .unwrap();

    let SubmissionOutcome::Accepted { report, .. } = outcome else {
        panic!("expected accepted outcome");
    };
    assert!(report.blur_metadata.is_none());
    let (sanitized, _) = f
        .store
        .load(&report.screenshot_sanitized.unwrap())
        .await
        .unwrap();
    assert_eq!(sanitized, png);
}

#[tokio::test]
#[serial]
async fn console_logs_are_attached_as_plain_text() {
    let f = fixture();
    let outcome = f
        .service
        .submit(SubmissionParams {
            console_logs: Some("TypeError: x is undefined".into()),
            ..valid_params()
        })
        .await
        .unwrap();

    let SubmissionOutcome::Accepted { report, .. } = outcome else {
        panic!("expected accepted outcome");
    };
    let key = report.console_logs.expect("console logs attached");
    let (bytes, mime) = f.store.load(&key).await.unwrap();
    assert_eq!(mime, "text/plain");
    assert_eq!(bytes, b"TypeError: x is undefined");
}

#[tokio::test]
#[serial]
async fn attachment_failure_does_not_roll_back_the_report() {
    std::env::set_var("BUGRELAY_DATA_DIR", tempfile::tempdir().unwrap().path());
    let repo = Arc::new(InMemRepo::new());
    let queue = Arc::new(RecordingQueue::default());
    let service = SubmissionService::new(
        repo.clone(),
        Arc::new(ValidatorStack::fallback_only()),
        Redactor::new(SanitizationConfig::builtin()),
        Arc::new(BrokenStore),
        queue.clone(),
    );

    let outcome = service
        .submit(SubmissionParams {
            screenshot: Some(Screenshot { bytes: tiny_png(), content_type: "image/png".into() }),
            ..valid_params()
        })
        .await
        .unwrap();

    let SubmissionOutcome::Accepted { report, .. } = outcome else {
        panic!("expected accepted outcome");
    };
    assert_eq!(report.status, Status::Validated);
    assert!(report.screenshot_original.is_none());
    // Still heads to publication despite the attachment failure.
    assert_eq!(queue.jobs.lock().unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn technical_context_round_trips_with_absent_fields_omitted() {
    let f = fixture();
    let outcome = f
        .service
        .submit(SubmissionParams {
            description: VALID_DESCRIPTION.into(),
            browser: Some("Firefox 128".into()),
            viewport: Some("1280x720".into()),
            ..SubmissionParams::default()
        })
        .await
        .unwrap();

    let SubmissionOutcome::Accepted { report, .. } = outcome else {
        panic!("expected accepted outcome");
    };
    let stored = f.repo.get(report.id).await.unwrap();
    let json = serde_json::to_value(&stored.technical_context).unwrap();
    assert_eq!(json["browser"], "Firefox 128");
    assert_eq!(json["viewport"], "1280x720");
    // Never-supplied fields are omitted, not nulled.
    assert!(json.get("os").is_none());
    assert!(json.get("user_agent").is_none());
    assert!(json.get("timestamp").is_some());
}

#[tokio::test]
#[serial]
async fn submitter_identity_is_stored_when_known() {
    let f = fixture();
    let outcome = f
        .service
        .submit(SubmissionParams {
            submitter: Some(Submitter { id: "u42".into(), email: None, buyer: true }),
            ..valid_params()
        })
        .await
        .unwrap();

    let SubmissionOutcome::Accepted { report, .. } = outcome else {
        panic!("expected accepted outcome");
    };
    assert_eq!(report.user_type(), "buyer");
    assert_eq!(report.submitter.unwrap().id, "u42");
}
