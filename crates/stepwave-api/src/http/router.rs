//! Axum router configuration with middleware.
//!
//! All routes are under `/api/v1/`. Middleware: CORS, request tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Step definitions
        .route("/definitions", post(handlers::definition::register_definition))
        .route("/definitions/{id}", get(handlers::definition::get_definition))
        // Instances
        .route("/instances", post(handlers::instance::create_instance))
        .route("/instances/{id}", get(handlers::instance::get_instance))
        .route("/instances/{id}/stream", get(handlers::stream::stream_instance))
        // Maintenance
        .route("/maintenance/recover", post(handlers::maintenance::recover))
        .route("/maintenance/health", post(handlers::maintenance::health_scan));

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Liveness probe.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
