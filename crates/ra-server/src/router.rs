//! Axum router construction.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route(
            "/jobs",
            get(routes::jobs::list_jobs).post(routes::jobs::create_job),
        )
        .route("/jobs/{id}", get(routes::jobs::get_job))
        .route("/jobs/{id}/cancel", post(routes::jobs::cancel_job))
        .route(
            "/stages/{step}/{video_id}",
            post(routes::stages::run_stage),
        );

    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}
