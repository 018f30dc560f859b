pub mod auth;
pub mod classifier;
pub mod error;
pub mod fallback;
pub mod github;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod openapi;
pub mod rate_limit;
pub mod redactor;
pub mod repo;
pub mod routes;
pub mod security;
pub mod storage;
pub mod submission;

// Re-export commonly used items for tests / external users
pub use routes::{config, AppState};
pub use security::SecurityHeaders;
pub use submission::{SubmissionOutcome, SubmissionParams, SubmissionService};
