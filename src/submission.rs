//! Submission orchestrator.
//!
//! Single-attempt, synchronous sequence: classify, persist, attach, set the
//! initial lifecycle status, and hand validated reports to the publication
//! job. Attachment processing is best-effort; a redaction failure never rolls
//! back report creation.

use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{error, info, warn};

use crate::classifier::{ValidationRequest, Validator};
use crate::jobs::{JobKind, JobQueue};
use crate::models::*;
use crate::redactor::Redactor;
use crate::repo::{RepoError, ReportRepo};
use crate::storage::{attachment_key, AttachmentKind, AttachmentStore};

const EXTERNAL_ID_LEN: usize = 12;

#[derive(Debug, Clone, Default)]
pub struct SubmissionParams {
    pub description: String,
    pub page_url: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub user_agent: Option<String>,
    pub viewport: Option<String>,
    pub console_logs: Option<String>,
    pub screenshot: Option<Screenshot>,
    pub submitter: Option<Submitter>,
}

#[derive(Debug, Clone)]
pub struct Screenshot {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

pub enum SubmissionOutcome {
    Accepted { report: BugReport, verdict: Verdict },
    Rejected { verdict: Verdict },
}

#[derive(thiserror::Error, Debug)]
pub enum SubmissionError {
    #[error(transparent)]
    Repo(#[from] RepoError),
}

pub struct SubmissionService {
    repo: Arc<dyn ReportRepo>,
    validator: Arc<dyn Validator>,
    redactor: Redactor,
    store: Arc<dyn AttachmentStore>,
    queue: Arc<dyn JobQueue>,
}

impl SubmissionService {
    pub fn new(
        repo: Arc<dyn ReportRepo>,
        validator: Arc<dyn Validator>,
        redactor: Redactor,
        store: Arc<dyn AttachmentStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self { repo, validator, redactor, store, queue }
    }

    pub async fn submit(&self, params: SubmissionParams) -> Result<SubmissionOutcome, SubmissionError> {
        metrics::increment_counter!("bugrelay_submissions_total");

        // The external id exists before any validation logic runs, so it is
        // independent of the classification outcome.
        let external_id = self.generate_external_id().await?;

        let technical_context = TechnicalContext {
            browser: params.browser.clone(),
            os: params.os.clone(),
            user_agent: params.user_agent.clone(),
            viewport: params.viewport.clone(),
            timestamp: Utc::now(),
        };

        let request = ValidationRequest {
            description: params.description.clone(),
            page_url: params.page_url.clone(),
            technical_context: technical_context.clone(),
        };
        let verdict = self.validator.validate(&request).await;

        if !verdict.storable() {
            metrics::increment_counter!("bugrelay_submissions_rejected_total");
            return Ok(SubmissionOutcome::Rejected { verdict });
        }

        let page_url = params.page_url.clone().unwrap_or_else(|| "unknown".to_string());
        let status = if verdict.needs_clarification {
            Status::NeedsClarification
        } else {
            Status::Validated
        };
        let snapshot = serde_json::to_value(&verdict).unwrap_or(serde_json::Value::Null);

        let mut report = self
            .repo
            .create(NewBugReport {
                external_id,
                submitter: params.submitter.clone(),
                page_url: page_url.clone(),
                description: params.description.clone(),
                sanitized_description: verdict.sanitized_description.clone(),
                title: verdict.title.clone(),
                category: verdict.category.clone(),
                severity: verdict.severity,
                quality_score: verdict.quality_score,
                validation_result: snapshot,
                technical_context,
                status,
            })
            .await?;

        if let Some(screenshot) = &params.screenshot {
            report = self.process_screenshot(report, screenshot, &page_url).await;
        }
        if let Some(logs) = &params.console_logs {
            report = self.process_console_logs(report, logs).await;
        }

        if status == Status::Validated {
            self.queue.enqueue(JobKind::CreateIssue, report.id);
        }
        info!(
            report = %report.external_id,
            status = %report.status,
            "bug report stored"
        );

        Ok(SubmissionOutcome::Accepted { report, verdict })
    }

    async fn generate_external_id(&self) -> Result<String, RepoError> {
        loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(EXTERNAL_ID_LEN)
                .map(|c| (c as char).to_ascii_lowercase())
                .collect();
            if !self.repo.external_id_taken(&candidate).await? {
                return Ok(candidate);
            }
        }
    }

    /// Attaches the original, runs the redactor, and attaches the sanitized
    /// copy. Every failure path degrades: worst case the original bytes are
    /// stored as the sanitized asset, so publication can always assume one
    /// exists when a screenshot exists.
    async fn process_screenshot(
        &self,
        report: BugReport,
        screenshot: &Screenshot,
        page_url: &str,
    ) -> BugReport {
        let mut report = report;

        let original_key = attachment_key(&report.external_id, AttachmentKind::ScreenshotOriginal);
        match self
            .store
            .save(&original_key, &screenshot.content_type, &screenshot.bytes)
            .await
        {
            Ok(()) => match self
                .repo
                .set_attachment(report.id, AttachmentKind::ScreenshotOriginal, original_key)
                .await
            {
                Ok(r) => report = r,
                Err(e) => error!("failed to record original screenshot: {e}"),
            },
            Err(e) => {
                error!("failed to store original screenshot: {e}");
                return report;
            }
        }

        let outcome = self.redactor.process(&screenshot.bytes, Some(page_url));
        let (sanitized, metadata) = match outcome {
            Some(o) => (o.sanitized, o.metadata),
            None => {
                // Redaction failed outright; reuse the original so the
                // sanitized asset still exists.
                warn!(report = %report.external_id, "redaction failed; reusing original screenshot");
                (screenshot.bytes.clone(), None)
            }
        };

        // Blurred output is PNG; a degraded copy keeps the original format.
        let sanitized_mime = infer::get(&sanitized)
            .map(|t| t.mime_type().to_string())
            .unwrap_or_else(|| screenshot.content_type.clone());
        let sanitized_key = attachment_key(&report.external_id, AttachmentKind::ScreenshotSanitized);
        match self.store.save(&sanitized_key, &sanitized_mime, &sanitized).await {
            Ok(()) => match self
                .repo
                .set_attachment(report.id, AttachmentKind::ScreenshotSanitized, sanitized_key)
                .await
            {
                Ok(r) => report = r,
                Err(e) => error!("failed to record sanitized screenshot: {e}"),
            },
            Err(e) => error!("failed to store sanitized screenshot: {e}"),
        }

        if let Some(meta) = metadata {
            match self.repo.set_blur_metadata(report.id, meta).await {
                Ok(r) => report = r,
                Err(e) => error!("failed to record blur metadata: {e}"),
            }
        }

        report
    }

    async fn process_console_logs(&self, report: BugReport, logs: &str) -> BugReport {
        let key = attachment_key(&report.external_id, AttachmentKind::ConsoleLogs);
        if let Err(e) = self.store.save(&key, "text/plain", logs.as_bytes()).await {
            error!("failed to store console logs: {e}");
            return report;
        }
        match self
            .repo
            .set_attachment(report.id, AttachmentKind::ConsoleLogs, key)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("failed to record console logs: {e}");
                report
            }
        }
    }
}
