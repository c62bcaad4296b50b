use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use crate::load_generator::{LoadSettings, LoadStatus};
use crate::AppState;

use super::AppError;

// ─── POST /api/load/start ────────────────────────────────────────

pub async fn start_load(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<LoadSettings>,
) -> Result<Json<LoadStatus>, AppError> {
    settings.validate().map_err(AppError::BadRequest)?;

    info!(
        concurrency = settings.concurrency,
        duration_secs = settings.duration_secs,
        error_pct = settings.error_pct,
        queue_header_pct = settings.queue_header_pct,
        "starting synthetic load"
    );
    if !state.load.try_start(state.agent.clone(), settings) {
        return Err(AppError::AlreadyRunning);
    }

    Ok(Json(state.load.status(&state.agent)))
}

// ─── POST /api/load/stop ─────────────────────────────────────────

pub async fn stop_load(State(state): State<Arc<AppState>>) -> Json<LoadStatus> {
    if state.load.stop().await {
        info!("synthetic load stopped");
    }
    Json(state.load.status(&state.agent))
}

// ─── GET /api/load/status ────────────────────────────────────────

pub async fn load_status(State(state): State<Arc<AppState>>) -> Json<LoadStatus> {
    Json(state.load.status(&state.agent))
}
