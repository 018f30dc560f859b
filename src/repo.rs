use crate::models::*;
use crate::storage::AttachmentKind;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

use async_trait::async_trait;

/// Persistence seam for the pipeline. Jobs and routes only see this trait;
/// the backend is picked by feature flag in `main`.
#[async_trait]
pub trait ReportRepo: Send + Sync {
    async fn create(&self, new: NewBugReport) -> RepoResult<BugReport>;
    async fn get(&self, id: Id) -> RepoResult<BugReport>;
    async fn get_by_external_id(&self, external_id: &str) -> RepoResult<BugReport>;
    async fn external_id_taken(&self, external_id: &str) -> RepoResult<bool>;
    async fn list_recent(&self, include_deleted: bool) -> RepoResult<Vec<BugReport>>;
    async fn update(&self, id: Id, upd: UpdateBugReport) -> RepoResult<BugReport>;
    async fn set_status(
        &self,
        id: Id,
        status: Status,
        rejection_reason: Option<String>,
    ) -> RepoResult<BugReport>;
    async fn set_issue(&self, id: Id, number: String, url: String) -> RepoResult<BugReport>;
    async fn set_attachment(&self, id: Id, kind: AttachmentKind, key: String)
        -> RepoResult<BugReport>;
    async fn set_blur_metadata(&self, id: Id, meta: BlurMetadata) -> RepoResult<BugReport>;
    async fn soft_delete(&self, id: Id) -> RepoResult<()>;
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock};

    const SNAPSHOT_FILE: &str = "reports.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        reports: HashMap<Id, BugReport>,
        next_id: Id,
    }

    /// In-memory repository with a JSON snapshot on disk. Good enough for
    /// dev and tests; the snapshot keeps reports across restarts.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("BUGRELAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(
                            "failed to parse snapshot '{}': {e}; starting empty",
                            path.display()
                        );
                        State::default()
                    }
                },
                Err(_) => State::default(),
            }
        }

        fn persist(&self) {
            let path = self.snapshot_path.clone();
            if let Ok(s) = serde_json::to_vec_pretty(&*self.state.read().unwrap()) {
                if let Some(dir) = path.parent() {
                    let _ = std::fs::create_dir_all(dir);
                }
                if let Err(e) = std::fs::write(&*path, s) {
                    tracing::warn!("failed to write snapshot '{}': {e}", path.display());
                }
            }
        }

        pub fn new() -> Self {
            let mut snapshot_path = Self::data_dir();
            snapshot_path.push(SNAPSHOT_FILE);
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn next_id(state: &mut State) -> Id {
            state.next_id += 1;
            state.next_id
        }

        fn mutate<F>(&self, id: Id, f: F) -> RepoResult<BugReport>
        where
            F: FnOnce(&mut BugReport),
        {
            let mut s = self.state.write().unwrap();
            let report = s.reports.get_mut(&id).ok_or(RepoError::NotFound)?;
            f(report);
            let updated = report.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ReportRepo for InMemRepo {
        async fn create(&self, new: NewBugReport) -> RepoResult<BugReport> {
            let mut s = self.state.write().unwrap();
            if s.reports.values().any(|r| r.external_id == new.external_id) {
                return Err(RepoError::Conflict);
            }
            let id = Self::next_id(&mut s);
            let report = BugReport {
                id,
                external_id: new.external_id,
                submitter: new.submitter,
                page_url: new.page_url,
                description: new.description,
                sanitized_description: new.sanitized_description,
                title: new.title,
                category: new.category,
                severity: new.severity,
                status: new.status,
                github_issue_number: None,
                github_issue_url: None,
                quality_score: new.quality_score,
                validation_result: new.validation_result,
                rejection_reason: None,
                internal_notes: None,
                technical_context: new.technical_context,
                blur_metadata: None,
                screenshot_original: None,
                screenshot_sanitized: None,
                console_logs: None,
                created_at: chrono::Utc::now(),
                deleted_at: None,
            };
            s.reports.insert(id, report.clone());
            drop(s);
            self.persist();
            Ok(report)
        }

        async fn get(&self, id: Id) -> RepoResult<BugReport> {
            let s = self.state.read().unwrap();
            s.reports.get(&id).cloned().ok_or(RepoError::NotFound)
        }

        async fn get_by_external_id(&self, external_id: &str) -> RepoResult<BugReport> {
            let s = self.state.read().unwrap();
            s.reports
                .values()
                .find(|r| r.external_id == external_id)
                .cloned()
                .ok_or(RepoError::NotFound)
        }

        async fn external_id_taken(&self, external_id: &str) -> RepoResult<bool> {
            let s = self.state.read().unwrap();
            Ok(s.reports.values().any(|r| r.external_id == external_id))
        }

        async fn list_recent(&self, include_deleted: bool) -> RepoResult<Vec<BugReport>> {
            let s = self.state.read().unwrap();
            let mut v: Vec<_> = s
                .reports
                .values()
                .filter(|r| include_deleted || r.deleted_at.is_none())
                .cloned()
                .collect();
            v.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(v)
        }

        async fn update(&self, id: Id, upd: UpdateBugReport) -> RepoResult<BugReport> {
            self.mutate(id, |r| {
                if let Some(status) = upd.status {
                    r.status = status;
                }
                if let Some(category) = upd.category {
                    r.category = Some(category);
                }
                if let Some(severity) = upd.severity {
                    r.severity = Some(severity);
                }
                if let Some(notes) = upd.internal_notes {
                    r.internal_notes = Some(notes);
                }
            })
        }

        async fn set_status(
            &self,
            id: Id,
            status: Status,
            rejection_reason: Option<String>,
        ) -> RepoResult<BugReport> {
            self.mutate(id, |r| {
                r.status = status;
                if rejection_reason.is_some() {
                    r.rejection_reason = rejection_reason;
                }
            })
        }

        async fn set_issue(&self, id: Id, number: String, url: String) -> RepoResult<BugReport> {
            self.mutate(id, |r| {
                r.github_issue_number = Some(number);
                r.github_issue_url = Some(url);
            })
        }

        async fn set_attachment(
            &self,
            id: Id,
            kind: AttachmentKind,
            key: String,
        ) -> RepoResult<BugReport> {
            self.mutate(id, |r| match kind {
                AttachmentKind::ScreenshotOriginal => r.screenshot_original = Some(key),
                AttachmentKind::ScreenshotSanitized => r.screenshot_sanitized = Some(key),
                AttachmentKind::ConsoleLogs => r.console_logs = Some(key),
            })
        }

        async fn set_blur_metadata(&self, id: Id, meta: BlurMetadata) -> RepoResult<BugReport> {
            self.mutate(id, |r| r.blur_metadata = Some(meta))
        }

        async fn soft_delete(&self, id: Id) -> RepoResult<()> {
            self.mutate(id, |r| r.deleted_at = Some(chrono::Utc::now()))?;
            Ok(())
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use sqlx::postgres::PgRow;
    use sqlx::{Pool, Postgres, Row};

    const COLUMNS: &str = "id, external_id, submitter, page_url, description, sanitized_description, \
         title, category, severity, status, github_issue_number, github_issue_url, quality_score, \
         validation_result, rejection_reason, internal_notes, technical_context, blur_metadata, \
         screenshot_original, screenshot_sanitized, console_logs, created_at, deleted_at";

    #[derive(Clone)]
    pub struct PgRepo {
        pool: Pool<Postgres>,
    }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self {
            Self { pool }
        }
    }

    fn internal(e: impl std::fmt::Display) -> RepoError {
        RepoError::Internal(e.to_string())
    }

    // JSON-ish fields are stored as TEXT and parsed here; a corrupt column is
    // surfaced as an internal error rather than a panic.
    fn row_to_report(row: &PgRow) -> RepoResult<BugReport> {
        let submitter: Option<String> = row.try_get("submitter").map_err(internal)?;
        let status: String = row.try_get("status").map_err(internal)?;
        let severity: Option<String> = row.try_get("severity").map_err(internal)?;
        let validation_result: Option<String> = row.try_get("validation_result").map_err(internal)?;
        let technical_context: String = row.try_get("technical_context").map_err(internal)?;
        let blur_metadata: Option<String> = row.try_get("blur_metadata").map_err(internal)?;

        Ok(BugReport {
            id: row.try_get("id").map_err(internal)?,
            external_id: row.try_get("external_id").map_err(internal)?,
            submitter: submitter
                .map(|s| serde_json::from_str(&s).map_err(internal))
                .transpose()?,
            page_url: row.try_get("page_url").map_err(internal)?,
            description: row.try_get("description").map_err(internal)?,
            sanitized_description: row.try_get("sanitized_description").map_err(internal)?,
            title: row.try_get("title").map_err(internal)?,
            category: row.try_get("category").map_err(internal)?,
            severity: severity.as_deref().and_then(Severity::parse),
            status: Status::parse(&status).ok_or_else(|| internal("unknown status"))?,
            github_issue_number: row.try_get("github_issue_number").map_err(internal)?,
            github_issue_url: row.try_get("github_issue_url").map_err(internal)?,
            quality_score: row.try_get("quality_score").map_err(internal)?,
            validation_result: validation_result
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            rejection_reason: row.try_get("rejection_reason").map_err(internal)?,
            internal_notes: row.try_get("internal_notes").map_err(internal)?,
            technical_context: serde_json::from_str(&technical_context).map_err(internal)?,
            blur_metadata: blur_metadata.and_then(|s| serde_json::from_str(&s).ok()),
            screenshot_original: row.try_get("screenshot_original").map_err(internal)?,
            screenshot_sanitized: row.try_get("screenshot_sanitized").map_err(internal)?,
            console_logs: row.try_get("console_logs").map_err(internal)?,
            created_at: row.try_get("created_at").map_err(internal)?,
            deleted_at: row.try_get("deleted_at").map_err(internal)?,
        })
    }

    impl PgRepo {
        async fn fetch(&self, id: Id) -> RepoResult<BugReport> {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM bug_reports WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?
                .ok_or(RepoError::NotFound)?;
            row_to_report(&row)
        }
    }

    #[async_trait]
    impl ReportRepo for PgRepo {
        async fn create(&self, new: NewBugReport) -> RepoResult<BugReport> {
            let submitter = new
                .submitter
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(internal)?;
            let technical_context =
                serde_json::to_string(&new.technical_context).map_err(internal)?;
            let validation_result =
                serde_json::to_string(&new.validation_result).map_err(internal)?;

            let row = sqlx::query(&format!(
                "INSERT INTO bug_reports \
                 (external_id, submitter, page_url, description, sanitized_description, title, \
                  category, severity, status, quality_score, validation_result, technical_context) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12) \
                 RETURNING {COLUMNS}"
            ))
            .bind(&new.external_id)
            .bind(submitter)
            .bind(&new.page_url)
            .bind(&new.description)
            .bind(&new.sanitized_description)
            .bind(&new.title)
            .bind(&new.category)
            .bind(new.severity.map(|s| s.as_str()))
            .bind(new.status.as_str())
            .bind(new.quality_score)
            .bind(validation_result)
            .bind(technical_context)
            .fetch_one(&self.pool)
            .await
            .map_err(|_| RepoError::Conflict)?;
            row_to_report(&row)
        }

        async fn get(&self, id: Id) -> RepoResult<BugReport> {
            self.fetch(id).await
        }

        async fn get_by_external_id(&self, external_id: &str) -> RepoResult<BugReport> {
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM bug_reports WHERE external_id = $1"
            ))
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?
            .ok_or(RepoError::NotFound)?;
            row_to_report(&row)
        }

        async fn external_id_taken(&self, external_id: &str) -> RepoResult<bool> {
            let row = sqlx::query("SELECT 1 AS one FROM bug_reports WHERE external_id = $1")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(internal)?;
            Ok(row.is_some())
        }

        async fn list_recent(&self, include_deleted: bool) -> RepoResult<Vec<BugReport>> {
            let sql = if include_deleted {
                format!("SELECT {COLUMNS} FROM bug_reports ORDER BY created_at DESC")
            } else {
                format!(
                    "SELECT {COLUMNS} FROM bug_reports WHERE deleted_at IS NULL ORDER BY created_at DESC"
                )
            };
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(internal)?;
            rows.iter().map(row_to_report).collect()
        }

        async fn update(&self, id: Id, upd: UpdateBugReport) -> RepoResult<BugReport> {
            sqlx::query(
                "UPDATE bug_reports SET \
                 status = COALESCE($2, status), \
                 category = COALESCE($3, category), \
                 severity = COALESCE($4, severity), \
                 internal_notes = COALESCE($5, internal_notes) \
                 WHERE id = $1",
            )
            .bind(id)
            .bind(upd.status.map(|s| s.as_str()))
            .bind(upd.category)
            .bind(upd.severity.map(|s| s.as_str()))
            .bind(upd.internal_notes)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            self.fetch(id).await
        }

        async fn set_status(
            &self,
            id: Id,
            status: Status,
            rejection_reason: Option<String>,
        ) -> RepoResult<BugReport> {
            sqlx::query(
                "UPDATE bug_reports SET status = $2, \
                 rejection_reason = COALESCE($3, rejection_reason) WHERE id = $1",
            )
            .bind(id)
            .bind(status.as_str())
            .bind(rejection_reason)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            self.fetch(id).await
        }

        async fn set_issue(&self, id: Id, number: String, url: String) -> RepoResult<BugReport> {
            sqlx::query(
                "UPDATE bug_reports SET github_issue_number = $2, github_issue_url = $3 WHERE id = $1",
            )
            .bind(id)
            .bind(number)
            .bind(url)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
            self.fetch(id).await
        }

        async fn set_attachment(
            &self,
            id: Id,
            kind: AttachmentKind,
            key: String,
        ) -> RepoResult<BugReport> {
            let column = match kind {
                AttachmentKind::ScreenshotOriginal => "screenshot_original",
                AttachmentKind::ScreenshotSanitized => "screenshot_sanitized",
                AttachmentKind::ConsoleLogs => "console_logs",
            };
            sqlx::query(&format!("UPDATE bug_reports SET {column} = $2 WHERE id = $1"))
                .bind(id)
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            self.fetch(id).await
        }

        async fn set_blur_metadata(&self, id: Id, meta: BlurMetadata) -> RepoResult<BugReport> {
            let meta = serde_json::to_string(&meta).map_err(internal)?;
            sqlx::query("UPDATE bug_reports SET blur_metadata = $2 WHERE id = $1")
                .bind(id)
                .bind(meta)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            self.fetch(id).await
        }

        async fn soft_delete(&self, id: Id) -> RepoResult<()> {
            sqlx::query("UPDATE bug_reports SET deleted_at = now() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(internal)?;
            Ok(())
        }
    }
}
