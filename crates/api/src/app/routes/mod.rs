use axum::{routing::get, Router};

pub mod admin;
pub mod alerts;
pub mod ingest;
pub mod jobs;
pub mod predictions;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/predictions", get(predictions::latest))
        .route("/predictions/history", get(predictions::history))
        .nest("/alerts", alerts::router())
        .nest("/jobs", jobs::router())
        .nest("/admin", admin::router())
        .nest("/ingest", ingest::router())
}
