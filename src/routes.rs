use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::TryStreamExt as _;

use crate::auth::{submitter_from, Auth, Role};
use crate::error::ApiError;
use crate::jobs::{JobKind, JobQueue};
use crate::models::*;
use crate::rate_limit::SubmissionLimiter;
use crate::repo::ReportRepo;
use crate::require_role;
use crate::storage::{attachment_key, AttachmentKind, AttachmentStore};
use crate::submission::{Screenshot, SubmissionOutcome, SubmissionParams, SubmissionService};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(web::resource("/bug_reports").route(web::post().to(submit_report)))
            .service(
                web::resource("/admin/bug_reports").route(web::get().to(admin_list_reports)),
            )
            .service(
                web::resource("/admin/bug_reports/{external_id}")
                    .route(web::get().to(admin_get_report))
                    .route(web::patch().to(admin_update_report)),
            )
            .service(
                web::resource("/admin/bug_reports/{external_id}/soft-delete")
                    .route(web::post().to(admin_soft_delete_report)),
            ),
    );
    // Attachment fetch without the /api/v1 prefix so admin tooling can link
    // blobs directly.
    cfg.route(
        "/attachments/{external_id}/{kind}",
        web::get().to(get_attachment),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub submission: Arc<SubmissionService>,
    pub repo: Arc<dyn ReportRepo>,
    pub store: Arc<dyn AttachmentStore>,
    pub queue: Arc<dyn JobQueue>,
    pub rate_limiter: Option<SubmissionLimiter>,
}

const SCREENSHOT_SIZE_LIMIT: usize = 10 * 1024 * 1024; // 10 MB
const TEXT_FIELD_LIMIT: usize = 512 * 1024;

const ALLOWED_SCREENSHOT_MIME: &[&str] =
    &["image/png", "image/jpeg", "image/gif", "image/webp"];

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct SubmittedReport {
    pub id: String,
    pub status: Status,
    pub needs_clarification: bool,
    pub clarification_message: Option<String>,
}

/// Collected multipart form fields for a submission.
#[derive(Default)]
struct SubmissionForm {
    description: Option<String>,
    page_url: Option<String>,
    browser: Option<String>,
    os: Option<String>,
    user_agent: Option<String>,
    viewport: Option<String>,
    console_logs: Option<String>,
    screenshot: Option<Screenshot>,
}

async fn read_form(payload: &mut Multipart) -> Result<SubmissionForm, ApiError> {
    let mut form = SubmissionForm::default();

    while let Some(field) = payload.try_next().await.map_err(|e| {
        log::error!("multipart error: {e}");
        ApiError::BadRequest
    })? {
        let Some(name) = field.content_disposition().get_name().map(str::to_string) else {
            continue;
        };
        let mut field_stream = field;
        let mut bytes: Vec<u8> = Vec::new();
        let limit = if name == "screenshot" { SCREENSHOT_SIZE_LIMIT } else { TEXT_FIELD_LIMIT };
        while let Some(chunk) = field_stream.try_next().await.map_err(|e| {
            log::error!("stream read error: {e}");
            ApiError::BadRequest
        })? {
            if bytes.len() + chunk.len() > limit {
                return Err(ApiError::BadRequest);
            }
            bytes.extend_from_slice(&chunk);
        }

        if name == "screenshot" {
            if bytes.is_empty() {
                continue;
            }
            let mime = infer::get(&bytes)
                .map(|t| t.mime_type().to_string())
                .unwrap_or_else(|| "application/octet-stream".into());
            if !ALLOWED_SCREENSHOT_MIME.contains(&mime.as_str()) {
                return Err(ApiError::BadRequest);
            }
            form.screenshot = Some(Screenshot { bytes, content_type: mime });
            continue;
        }

        let value = String::from_utf8(bytes).map_err(|_| ApiError::BadRequest)?;
        let value = value.trim().to_string();
        if value.is_empty() {
            continue;
        }
        match name.as_str() {
            "description" => form.description = Some(value),
            "page_url" => form.page_url = Some(value),
            "browser" => form.browser = Some(value),
            "os" => form.os = Some(value),
            "user_agent" => form.user_agent = Some(value),
            "viewport" => form.viewport = Some(value),
            "console_logs" => form.console_logs = Some(value),
            _ => {}
        }
    }

    Ok(form)
}

#[utoipa::path(
    post,
    path = "/api/v1/bug_reports",
    responses(
        (status = 201, description = "Report stored", body = SubmittedReport),
        (status = 422, description = "Report rejected by validation"),
        (status = 429, description = "Too many submissions"),
        (status = 400, description = "Malformed submission")
    )
)]
pub async fn submit_report(
    req: HttpRequest,
    auth: Option<Auth>,
    data: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    if let Some(limiter) = &data.rate_limiter {
        let ip = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("unknown")
            .to_string();
        if !limiter.allow_submission(&ip) {
            return Err(ApiError::TooManyRequests);
        }
    }

    let form = read_form(&mut payload).await?;
    let Some(description) = form.description else {
        return Err(ApiError::BadRequest);
    };

    // Fall back to the referring page, then a literal "unknown".
    let page_url = form
        .page_url
        .or_else(|| {
            req.headers()
                .get(actix_web::http::header::REFERER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string());

    let params = SubmissionParams {
        description,
        page_url: Some(page_url),
        browser: form.browser,
        os: form.os,
        user_agent: form.user_agent,
        viewport: form.viewport,
        console_logs: form.console_logs,
        screenshot: form.screenshot,
        submitter: submitter_from(auth.as_ref()),
    };

    match data.submission.submit(params).await.map_err(|e| {
        log::error!("submission failed: {e}");
        ApiError::Internal
    })? {
        SubmissionOutcome::Accepted { report, verdict } => {
            Ok(HttpResponse::Created().json(serde_json::json!({
                "success": true,
                "bug_report": SubmittedReport {
                    id: report.external_id,
                    status: report.status,
                    needs_clarification: report.status == Status::NeedsClarification,
                    clarification_message: verdict.clarification_message,
                }
            })))
        }
        SubmissionOutcome::Rejected { verdict } => {
            Ok(HttpResponse::UnprocessableEntity().json(serde_json::json!({
                "success": false,
                "error": verdict
                    .rejection_reason
                    .unwrap_or_else(|| "Invalid bug report".to_string()),
                "needs_clarification": verdict.needs_clarification,
                "clarification_message": verdict.clarification_message,
            })))
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/bug_reports",
    params(("include_deleted" = Option<bool>, Query, description = "Include soft-deleted reports")),
    responses(
        (status = 200, description = "List reports", body = [BugReport]),
        (status = 403, description = "Forbidden – Admins only")
    )
)]
pub async fn admin_list_reports(
    req: HttpRequest,
    auth: Auth,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let want_deleted = req.query_string().contains("include_deleted=1");
    let reports = data.repo.list_recent(want_deleted).await?;
    Ok(HttpResponse::Ok().json(reports))
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/bug_reports/{external_id}",
    params(("external_id" = String, Path, description = "External report id")),
    responses(
        (status = 200, description = "Report detail", body = BugReport),
        (status = 404, description = "Report not found"),
        (status = 403, description = "Forbidden – Admins only")
    )
)]
pub async fn admin_get_report(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let report = data.repo.get_by_external_id(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[utoipa::path(
    patch,
    path = "/api/v1/admin/bug_reports/{external_id}",
    request_body = UpdateBugReport,
    params(("external_id" = String, Path, description = "External report id")),
    responses(
        (status = 200, description = "Report updated", body = BugReport),
        (status = 404, description = "Report not found"),
        (status = 403, description = "Forbidden – Admins only")
    )
)]
pub async fn admin_update_report(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateBugReport>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let report = data.repo.get_by_external_id(&path.into_inner()).await?;
    let upd = payload.into_inner();

    let status_change = upd.status.filter(|s| *s != report.status);
    if let Some(new_status) = status_change {
        if !report.status.can_transition(new_status, StatusActor::Operator) {
            return Err(ApiError::BadRequest);
        }
    }

    let updated = data.repo.update(report.id, upd).await?;

    if let Some(new_status) = status_change {
        if updated.github_issue_created() {
            data.queue.enqueue(JobKind::SyncStatus, updated.id);
        }
        if updated.submitter.is_some() {
            data.queue.enqueue(JobKind::SendStatusUpdate, updated.id);
        }
        // An operator promoting a clarified report re-enters the publication
        // pipeline.
        if new_status == Status::Validated && !updated.github_issue_created() {
            data.queue.enqueue(JobKind::CreateIssue, updated.id);
        }
    }

    Ok(HttpResponse::Ok().json(updated))
}

pub async fn admin_soft_delete_report(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let report = data.repo.get_by_external_id(&path.into_inner()).await?;
    data.repo.soft_delete(report.id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "ok"})))
}

/// Serve a stored attachment by report external id and kind.
pub async fn get_attachment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let (external_id, kind) = path.into_inner();
    let kind = AttachmentKind::parse(&kind).ok_or(ApiError::NotFound)?;

    // Only keys the report actually references are servable.
    let report = data.repo.get_by_external_id(&external_id).await?;
    let key = attachment_key(&report.external_id, kind);
    let recorded = match kind {
        AttachmentKind::ScreenshotOriginal => report.screenshot_original.as_deref(),
        AttachmentKind::ScreenshotSanitized => report.screenshot_sanitized.as_deref(),
        AttachmentKind::ConsoleLogs => report.console_logs.as_deref(),
    };
    if recorded != Some(key.as_str()) {
        return Err(ApiError::NotFound);
    }

    let (bytes, mime) = data.store.load(&key).await?;
    Ok(HttpResponse::Ok()
        .insert_header(("Content-Type", mime))
        .body(bytes))
}
