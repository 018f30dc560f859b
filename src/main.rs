use actix_cors::Cors;
use actix_web::{middleware::Compress, App, HttpServer};
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod classifier;
mod error;
mod fallback;
mod github;
mod jobs;
mod models;
mod notify;
mod openapi;
mod rate_limit;
mod redactor;
mod repo;
mod routes;
mod security;
mod storage;
mod submission;

use classifier::ValidatorStack;
use github::GithubClient;
use jobs::{InProcessQueue, JobContext};
use notify::LogNotifier;
use openapi::ApiDoc;
use rate_limit::SubmissionLimiter;
use redactor::Redactor;
use routes::{config, AppState};
use security::SecurityHeaders;
use storage::build_attachment_store;
use submission::SubmissionService;

use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Environment variables must be set externally (shell, systemd, Docker).
    // Load .env automatically only in debug builds.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Bootstrapping bugrelay server");
    info!(
        "Remote classifier configured: {}",
        std::env::var("OPENAI_ACCESS_TOKEN").is_ok()
    );
    info!(
        "GitHub tracker configured: {}",
        std::env::var("GITHUB_ACCESS_TOKEN").is_ok()
    );

    if let Ok(addr) = std::env::var("METRICS_ADDR") {
        match addr.parse::<std::net::SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
                    .with_http_listener(addr)
                    .install()
                {
                    warn!("failed to start Prometheus exporter on {addr}: {e}");
                }
            }
            Err(e) => warn!("invalid METRICS_ADDR '{addr}': {e}"),
        }
    }

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo = {
        info!("Using in-memory repository backend");
        repo::inmem::InMemRepo::new()
    };

    #[cfg(feature = "postgres-store")]
    let repo = {
        use sqlx::postgres::PgPoolOptions;
        let db_url =
            std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&db_url)
            .expect("Failed to create Pg pool");
        if let Err(e) = sqlx::migrate!().run(&pool).await {
            warn!("migrations failed (continuing with existing schema): {e}");
        }
        info!("Using Postgres repository backend");
        repo::pg::PgRepo::new(pool)
    };

    let repo: Arc<dyn repo::ReportRepo> = Arc::new(repo);
    let store = build_attachment_store().await;
    let tracker = GithubClient::from_env()
        .map(|c| Arc::new(c) as Arc<dyn github::IssueTracker>);
    if tracker.is_none() {
        warn!("GITHUB_ACCESS_TOKEN / GITHUB_REPO not set; validated reports will not be published");
    }

    let queue = InProcessQueue::start(JobContext {
        repo: repo.clone(),
        tracker,
        notifier: Arc::new(LogNotifier),
    });

    let submission = Arc::new(SubmissionService::new(
        repo.clone(),
        Arc::new(ValidatorStack::from_env()),
        Redactor::from_env(),
        store.clone(),
        queue.clone(),
    ));

    let state = AppState {
        submission,
        repo,
        store,
        queue,
        rate_limiter: Some(SubmissionLimiter::from_env()),
    };

    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PATCH", "OPTIONS"])
                .max_age(3600);
            if let Ok(front) = std::env::var("FRONTEND_URL") {
                c = c.allowed_origin(&front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(SecurityHeaders::from_env())
            .wrap(cors)
            .configure(config)
            .service(SwaggerUi::new("/docs").url("/docs/openapi.json", openapi.clone()))
            .app_data(actix_web::web::Data::new(state.clone()))
    })
    .bind(("0.0.0.0", 8080))?;

    info!("Listening on http://0.0.0.0:8080");

    server.run().await
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    use std::env;

    let required = vec!["JWT_SECRET"];

    let mut missing = Vec::new();
    for var in required {
        if env::var(var).is_err() {
            missing.push(var);
        }
    }

    if !missing.is_empty() {
        eprintln!("Missing required environment variables: {:?}", missing);
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    if let Ok(secret) = env::var("JWT_SECRET") {
        if secret.len() < 32 {
            eprintln!("JWT_SECRET must be at least 32 characters long for security");
            std::process::exit(1);
        }
    }

    if env::var("OPENAI_ACCESS_TOKEN").is_err() {
        eprintln!("Warning: OPENAI_ACCESS_TOKEN not set; classification will use the deterministic fallback only");
    }
    if env::var("GITHUB_ACCESS_TOKEN").is_err() || env::var("GITHUB_REPO").is_err() {
        eprintln!("Warning: GitHub publication not configured (GITHUB_ACCESS_TOKEN/GITHUB_REPO missing)");
    }
}
