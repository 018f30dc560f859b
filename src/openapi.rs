use crate::models::{
    BlurMetadata, BugReport, Severity, Status, Submitter, TechnicalContext, UpdateBugReport,
    Verdict,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::submit_report,
        crate::routes::admin_list_reports,
        crate::routes::admin_get_report,
        crate::routes::admin_update_report,
    ),
    components(schemas(
        BugReport, UpdateBugReport, Verdict, Status, Severity,
        TechnicalContext, BlurMetadata, Submitter,
        crate::routes::SubmittedReport
    )),
    tags(
        (name = "bug_reports", description = "Bug report submission"),
        (name = "admin", description = "Operator review operations"),
    )
)]
pub struct ApiDoc;
