//! Demo controller. Each action exercises one instrumentation path:
//! plain success, inline rendering, handler failure, a failing pre-action
//! filter, and the two kinds of exclusion.

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::RequestInfo;
use crate::config::AgentConfig;
use crate::middleware::TracedRequest;
use crate::AppState;

use super::AppError;

/// Actions that must never be instrumented.
pub const IGNORED_ACTIONS: &[&str] = &["agent_test/action_to_ignore", "agent_test/entry_action"];

/// Actions that record metrics but no apdex.
pub const APDEX_IGNORED_ACTIONS: &[&str] = &["agent_test/action_to_ignore_apdex"];

/// Add this controller's exclusions to `config`.
pub fn register_exclusions(config: &mut AgentConfig) {
    config
        .ignored_actions
        .extend(IGNORED_ACTIONS.iter().map(|a| a.to_string()));
    config
        .apdex_ignored_actions
        .extend(APDEX_IGNORED_ACTIONS.iter().map(|a| a.to_string()));
}

/// Longest `wait` the index action honours (seconds).
const MAX_WAIT_SECS: f64 = 5.0;

// ─── GET /agent_test/index ───────────────────────────────────────

/// Echoes the query parameters. `wait=<secs>` holds the request open.
pub async fn index(
    traced: Option<Extension<TracedRequest>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let wait = params
        .get("wait")
        .and_then(|w| w.parse::<f64>().ok())
        .filter(|w| w.is_finite() && *w > 0.0)
        .map(|w| w.min(MAX_WAIT_SECS));

    if let Some(secs) = wait {
        if let Some(Extension(t)) = &traced {
            t.push_segment("Custom/agent_test/wait");
        }
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        if let Some(Extension(t)) = &traced {
            t.pop_segment();
        }
    }

    Json(json!({ "params": params }))
}

// ─── GET /agent_test/action_inline ───────────────────────────────

pub async fn action_inline() -> &'static str {
    "foofah"
}

// ─── GET /agent_test/action_with_error ───────────────────────────

pub async fn action_with_error() -> Result<&'static str, AppError> {
    Err(AppError::Internal("this is an uncaught error".into()))
}

// ─── GET /agent_test/action_with_before_filter_error ─────────────

pub async fn action_with_before_filter_error() -> Result<&'static str, AppError> {
    before_filter()?;
    Ok("unreachable")
}

fn before_filter() -> Result<(), AppError> {
    Err(AppError::Internal("before filter refused the request".into()))
}

// ─── GET /agent_test/action_to_ignore ────────────────────────────

pub async fn action_to_ignore() -> &'static str {
    "ignored"
}

// ─── GET /agent_test/action_to_ignore_apdex ──────────────────────

pub async fn action_to_ignore_apdex() -> &'static str {
    "no apdex"
}

// ─── GET /agent_test/entry_action ────────────────────────────────

/// Excluded itself, but calls one traced and one untraced helper.
pub async fn entry_action(State(state): State<Arc<AppState>>) -> Result<String, AppError> {
    let untraced = internal_action();
    let traced = state
        .agent
        .instrument(RequestInfo::new("agent_test/internal_traced_action"), |_| {
            internal_traced_action()
        })?;
    Ok(format!("{untraced} {traced}"))
}

fn internal_action() -> &'static str {
    "internal"
}

fn internal_traced_action() -> Result<&'static str, AppError> {
    Ok("traced")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusions_are_registered() {
        let mut config = AgentConfig::default();
        register_exclusions(&mut config);
        assert!(config.is_ignored("agent_test/entry_action"));
        assert!(config.is_ignored("agent_test/action_to_ignore"));
        assert!(config.is_apdex_ignored("agent_test/action_to_ignore_apdex"));
        assert!(!config.is_ignored("agent_test/index"));
    }
}
