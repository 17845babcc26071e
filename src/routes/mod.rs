use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;

pub mod events;
pub mod health;
pub mod jobs;

/// No authentication or multi-tenant isolation is in scope (spec §1
/// Non-goals), so unlike the teacher's per-origin allow-list this mirrors
/// whatever origin the client sends.
pub fn create_router(state: AppState) -> Router<()> {
    let max_upload_bytes = state.config.max_upload_bytes;

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_headers(tower_http::cors::AllowHeaders::mirror_request());

    let jobs_routes = Router::new()
        .route("/", axum::routing::post(jobs::upload_job))
        .route("/:id", get(jobs::get_job))
        .route("/:id/events", get(events::job_events))
        .route("/:id/result", get(jobs::download_result))
        .route("/:id/retry", axum::routing::post(jobs::retry_job));

    Router::new()
        .nest("/api/jobs", jobs_routes)
        .route("/healthz", get(health::health_check))
        .with_state(state)
        .layer(cors)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
}
