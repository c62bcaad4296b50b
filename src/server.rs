use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::metrics::stream;
use crate::middleware;
use crate::AppState;

/// Builds the full Axum `Router`: the instrumented demo controller plus the
/// agent's own (uninstrumented) control endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    use handlers::agent_test as demo;

    // ── Instrumented controller ─────────────────────────────────
    let instrumented = Router::new()
        .route("/agent_test/index", get(demo::index))
        .route("/agent_test/action_inline", get(demo::action_inline))
        .route("/agent_test/action_with_error", get(demo::action_with_error))
        .route(
            "/agent_test/action_with_before_filter_error",
            get(demo::action_with_before_filter_error),
        )
        .route("/agent_test/action_to_ignore", get(demo::action_to_ignore))
        .route(
            "/agent_test/action_to_ignore_apdex",
            get(demo::action_to_ignore_apdex),
        )
        .route("/agent_test/entry_action", get(demo::entry_action))
        // route_layer so the middleware sees the MatchedPath
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::instrument,
        ));

    Router::new()
        .merge(instrumented)
        // ── Load generator control ──────────────────────────────
        .route("/api/load/start", post(handlers::load::start_load))
        .route("/api/load/stop", post(handlers::load::stop_load))
        .route("/api/load/status", get(handlers::load::load_status))
        // ── Metrics ─────────────────────────────────────────────
        .route("/api/metrics", get(stream::get_metrics))
        .route("/api/metrics/stream", get(stream::metrics_stream))
        .route("/api/harvest", post(stream::harvest))
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
        .layer(CorsLayer::permissive())
}
