//! GitHub issue client.
//!
//! Thin HTTP wrapper; the pipeline depends on the [`IssueTracker`] trait, so
//! tests substitute a recording stub and the wiremock suite exercises this
//! implementation against a local server via `GITHUB_API_BASE`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::models::BugReport;

const ISSUE_TITLE_MAX_CHARS: usize = 256;
const BROWSER_MAX_CHARS: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("tracker returned status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueRef {
    pub number: u64,
    #[serde(rename = "html_url")]
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueState {
    Open,
    Closed,
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, issue: &NewIssue) -> Result<IssueRef, TrackerError>;
    async fn update_issue(
        &self,
        number: u64,
        state: IssueState,
        labels: Vec<String>,
    ) -> Result<(), TrackerError>;
    async fn add_comment(&self, number: u64, body: &str) -> Result<(), TrackerError>;
}

pub struct GithubClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    repo: String,
}

impl GithubClient {
    /// Returns `None` when no access token is configured; publication then
    /// logs and skips instead of failing submissions.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("GITHUB_ACCESS_TOKEN").ok()?;
        let repo = std::env::var("GITHUB_REPO").ok()?;
        let base_url = std::env::var("GITHUB_API_BASE")
            .unwrap_or_else(|_| "https://api.github.com".to_string());
        Some(Self::new(base_url, token, repo))
    }

    pub fn new(base_url: String, token: String, repo: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bugrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client, base_url, token, repo }
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.base_url, self.repo)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("token {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
    }
}

#[async_trait]
impl IssueTracker for GithubClient {
    async fn create_issue(&self, issue: &NewIssue) -> Result<IssueRef, TrackerError> {
        let resp = self
            .request(self.client.post(self.issues_url()))
            .json(issue)
            .send()
            .await?;
        if !resp.status().is_success() {
            error!("failed to create issue: status {}", resp.status());
            return Err(TrackerError::Status(resp.status().as_u16()));
        }
        Ok(resp.json::<IssueRef>().await?)
    }

    async fn update_issue(
        &self,
        number: u64,
        state: IssueState,
        labels: Vec<String>,
    ) -> Result<(), TrackerError> {
        let resp = self
            .request(self.client.patch(format!("{}/{}", self.issues_url(), number)))
            .json(&serde_json::json!({ "state": state, "labels": labels }))
            .send()
            .await?;
        if !resp.status().is_success() {
            error!("failed to update issue #{number}: status {}", resp.status());
            return Err(TrackerError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<(), TrackerError> {
        let resp = self
            .request(
                self.client
                    .post(format!("{}/{}/comments", self.issues_url(), number)),
            )
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        if !resp.status().is_success() {
            error!("failed to comment on issue #{number}: status {}", resp.status());
            return Err(TrackerError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Builds the public issue payload for a report: sanitized description, a
/// fixed technical-details block, and the internal-id footer.
pub fn issue_content(report: &BugReport) -> NewIssue {
    let mut body_parts = vec![
        report.publishable_description().to_string(),
        String::new(),
        "## Technical Details".to_string(),
        format!("- **Page URL**: {}", report.page_url),
        format!("- **User Type**: {}", report.user_type()),
        format!(
            "- **Category**: {}",
            report.category.as_deref().unwrap_or("Uncategorized")
        ),
        format!(
            "- **Severity**: {}",
            report
                .severity
                .map(|s| s.as_str())
                .unwrap_or("Unknown")
        ),
    ];

    if let Some(score) = report.quality_score {
        body_parts.push(format!("- **Quality Score**: {score:.0}"));
    }
    if let Some(browser) = &report.technical_context.browser {
        body_parts.push(format!("- **Browser**: {}", truncate(browser, BROWSER_MAX_CHARS)));
    }
    if let Some(os) = &report.technical_context.os {
        body_parts.push(format!("- **OS**: {os}"));
    }
    if let Some(viewport) = &report.technical_context.viewport {
        body_parts.push(format!("- **Viewport**: {viewport}"));
    }
    if report.screenshot_sanitized.is_some() {
        body_parts.push("- **Screenshot**: Attached".to_string());
    }

    body_parts.push(String::new());
    body_parts.push("---".to_string());
    body_parts.push(format!(
        "*This issue was automatically created from a bug report. Internal ID: {}*",
        report.external_id
    ));

    NewIssue {
        title: truncate(
            report.title.as_deref().unwrap_or("Bug Report"),
            ISSUE_TITLE_MAX_CHARS,
        ),
        body: body_parts.join("\n"),
        labels: issue_labels(report),
    }
}

pub fn issue_labels(report: &BugReport) -> Vec<String> {
    let mut labels = vec!["bug-report".to_string()];
    labels.push(format!("user-type:{}", report.user_type()));
    if let Some(category) = &report.category {
        labels.push(format!("category:{category}"));
    }
    if let Some(severity) = report.severity {
        labels.push(format!("severity:{severity}"));
    }
    labels
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}
