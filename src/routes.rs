use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use tower_http::cors::CorsLayer;

use crate::api::routes::admin::admin_routes;
use crate::app_state::AppState;

/// Build the main application router: a health check, and the admin
/// surface that exercises the live scheduling framework. The actual
/// request-proxying front end that forwards inference traffic to the
/// pod this router chose lives outside this crate.
pub fn app_router() -> Router<AppState> {
    let api_v1 = Router::new().nest("/admin", admin_routes());

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .nest("/api/v1", api_v1)
        .fallback(handler_404)
        .layer(CorsLayer::very_permissive())
}

async fn root() -> &'static str {
    "inference router is running"
}

async fn health_check() -> &'static str {
    "OK"
}

async fn handler_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "the requested resource was not found")
}
