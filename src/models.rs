use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub type Id = i64;

/// Lifecycle states for a bug report. Only `Pending` is assignable before
/// classification; everything else is reached through the transition rules
/// in [`Status::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Validated,
    Rejected,
    NeedsClarification,
    GithubCreated,
    Resolved,
    Duplicate,
}

/// Who is asking for a status change. Operators may set anything; the
/// orchestrator and the publication job are restricted to their own moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusActor {
    Orchestrator,
    Publisher,
    Operator,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Validated => "validated",
            Status::Rejected => "rejected",
            Status::NeedsClarification => "needs_clarification",
            Status::GithubCreated => "github_created",
            Status::Resolved => "resolved",
            Status::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "pending" => Some(Status::Pending),
            "validated" => Some(Status::Validated),
            "rejected" => Some(Status::Rejected),
            "needs_clarification" => Some(Status::NeedsClarification),
            "github_created" => Some(Status::GithubCreated),
            "resolved" => Some(Status::Resolved),
            "duplicate" => Some(Status::Duplicate),
            _ => None,
        }
    }

    /// Single transition function validating legal moves. The publication job
    /// is the only actor that may reach `github_created`; the orchestrator may
    /// only assign the initial post-classification states.
    pub fn can_transition(self, to: Status, actor: StatusActor) -> bool {
        use Status::*;
        match actor {
            StatusActor::Operator => true,
            StatusActor::Publisher => {
                matches!((self, to), (Validated, GithubCreated) | (Validated, Rejected))
            }
            StatusActor::Orchestrator => matches!(
                (self, to),
                (Pending, Validated) | (Pending, NeedsClarification) | (Pending, Rejected)
            ),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured outcome of classification. Both the remote and the fallback
/// validators produce this shape, so downstream gating never cares which
/// path ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Verdict {
    pub valid: bool,
    pub quality_score: Option<f64>,
    pub category: Option<String>,
    pub severity: Option<Severity>,
    pub title: Option<String>,
    pub sanitized_description: Option<String>,
    pub rejection_reason: Option<String>,
    pub needs_clarification: bool,
    pub clarification_message: Option<String>,
}

impl Verdict {
    /// Valid-or-clarification reports are stored; everything else is turned
    /// away without a record.
    pub fn storable(&self) -> bool {
        self.valid || self.needs_clarification
    }
}

/// Browser/OS/viewport capture taken at submission time. Optional fields are
/// omitted from the serialized payload when they were never supplied.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TechnicalContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Audit record of what the redactor did (or would have done) to a screenshot.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BlurMetadata {
    pub blurred_patterns: Vec<String>,
    pub blurred_selectors: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Submitter {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub buyer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BugReport {
    pub id: Id,
    /// Externally visible identifier; assigned once at creation, never the
    /// internal sequential key.
    pub external_id: String,
    pub submitter: Option<Submitter>,
    pub page_url: String,
    pub description: String,
    pub sanitized_description: Option<String>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub severity: Option<Severity>,
    pub status: Status,
    pub github_issue_number: Option<String>,
    pub github_issue_url: Option<String>,
    pub quality_score: Option<f64>,
    /// Opaque snapshot of the full classifier verdict, kept for audit.
    #[schema(value_type = Object)]
    pub validation_result: Value,
    pub rejection_reason: Option<String>,
    pub internal_notes: Option<String>,
    pub technical_context: TechnicalContext,
    pub blur_metadata: Option<BlurMetadata>,
    pub screenshot_original: Option<String>,
    pub screenshot_sanitized: Option<String>,
    pub console_logs: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>, // soft delete marker
}

impl BugReport {
    pub fn user_type(&self) -> &'static str {
        match &self.submitter {
            None => "anonymous",
            Some(s) if s.buyer => "buyer",
            Some(_) => "seller",
        }
    }

    pub fn github_issue_created(&self) -> bool {
        self.github_issue_number.is_some()
    }

    /// Text the publication gates and issue body operate on.
    pub fn publishable_description(&self) -> &str {
        self.sanitized_description
            .as_deref()
            .unwrap_or(&self.description)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewBugReport {
    pub external_id: String,
    pub submitter: Option<Submitter>,
    pub page_url: String,
    pub description: String,
    pub sanitized_description: Option<String>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub severity: Option<Severity>,
    pub quality_score: Option<f64>,
    #[schema(value_type = Object)]
    pub validation_result: Value,
    pub technical_context: TechnicalContext,
    pub status: Status,
}

/// Operator-editable subset; everything else is pipeline-owned.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateBugReport {
    pub status: Option<Status>,
    pub category: Option<String>,
    pub severity: Option<Severity>,
    pub internal_notes: Option<String>,
}
