use axum::{
    middleware as axum_mw,
    routing::{delete, get, patch},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::middleware::timing;
use crate::AppState;

/// Builds the full Axum `Router` with the dashboard API, demo routes and
/// the request-sampling middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Demo endpoints ──────────────────────────────────────
        .route("/", get(handlers::demo::index))
        .route("/ping", get(handlers::demo::ping))
        .route("/patch", patch(handlers::demo::patch))
        .route("/fail", get(handlers::demo::fail))
        .route("/sensitive", get(handlers::demo::sensitive))
        // ── Metrics ─────────────────────────────────────────────
        .route("/metrics/json", get(handlers::metrics::get_report))
        .route("/metrics/table_overview", get(handlers::metrics::get_overview))
        .route("/metrics/stream", get(handlers::stream::metrics_stream))
        .route("/metrics/diagnostics", get(handlers::metrics::get_diagnostics))
        .route("/metrics/health", get(handlers::metrics::health))
        .route("/metrics/reset", delete(handlers::metrics::reset))
        // ── Sampling runs after routing so MatchedPath is set ───
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            timing::timing_middleware,
        ))
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
        .layer(CorsLayer::permissive())
}
