pub mod agent_test;
pub mod load;

use std::fmt;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

// ─── Unified error type ──────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Internal(String),
    AlreadyRunning,
}

/// Marker left on an error response so the instrumentation middleware can
/// count the failure. The response itself is not altered.
#[derive(Debug, Clone)]
pub struct NoticedError(pub String);

impl fmt::Display for NoticedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadRequest(msg) | Self::Internal(msg) => f.write_str(msg),
            Self::AlreadyRunning => f.write_str("Load generator already running"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AlreadyRunning => StatusCode::CONFLICT,
        };
        let message = self.to_string();

        let body = serde_json::json!({
            "error":  message,
            "status": status.as_u16(),
        });

        let mut response = (status, Json(body)).into_response();
        if status.is_server_error() {
            response.extensions_mut().insert(NoticedError(message));
        }
        response
    }
}
