use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Query, Request, State},
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::agent::{RequestContext, RequestInfo};
use crate::handlers::NoticedError;
use crate::metrics::QueueHeaders;
use crate::AppState;

/// Handle to the in-flight request context, placed in the request
/// extensions so handlers can open trace segments.
#[derive(Clone)]
pub struct TracedRequest {
    slot: Arc<Mutex<Option<RequestContext>>>,
}

impl TracedRequest {
    pub fn push_segment(&self, name: impl Into<String>) {
        if let Some(ctx) = self.slot.lock().as_mut() {
            ctx.push_segment(name);
        }
    }

    pub fn pop_segment(&self) -> Option<f64> {
        self.slot.lock().as_mut().and_then(RequestContext::pop_segment)
    }

    pub fn add_custom_param(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let Some(ctx) = self.slot.lock().as_mut() {
            ctx.add_custom_param(key, value);
        }
    }
}

/// Route-level middleware that reports every request to the agent.
///
/// Adds two response headers:
///
///   X-Response-Time-Us: total handler wall time in microseconds
///   Server-Timing: same value in the standard Server-Timing format
///
/// Handler failures travel as a `NoticedError` response extension; they are
/// counted and the response is returned untouched.
pub async fn instrument(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let action = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| action_name(p.as_str()))
        .unwrap_or_else(|| action_name(&path));

    let start = Instant::now();
    let slot = match state.agent.start_request(request_info(&req, action.clone())) {
        Some(ctx) => {
            let slot = Arc::new(Mutex::new(Some(ctx)));
            req.extensions_mut().insert(TracedRequest { slot: slot.clone() });
            Some(slot)
        }
        None => None,
    };

    let mut response = next.run(req).await;
    let elapsed = start.elapsed();

    if let Some(ctx) = slot.and_then(|slot| slot.lock().take()) {
        let noticed = response.extensions().get::<NoticedError>().cloned();
        state.agent.finish_request(
            ctx,
            noticed.as_ref().map(|e| e as &dyn std::fmt::Display),
        );
    }

    // ── Inject response headers ─────────────────────────────────
    let us = elapsed.as_micros();
    if let Ok(val) = us.to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Us", val);
    }

    let server_timing =
        format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(val) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", val);
    }

    debug!(
        status = response.status().as_u16(),
        %method,
        %path,
        action = %action,
        us = us as u64,
        "request"
    );

    response
}

/// `/agent_test/index` → `agent_test/index`
fn action_name(route: &str) -> String {
    route.trim_matches('/').to_owned()
}

fn request_info(req: &Request, action: String) -> RequestInfo {
    let headers = QueueHeaders::from_pairs(req.headers().iter().filter_map(|(name, value)| {
        value.to_str().ok().map(|v| (name.as_str(), v.to_owned()))
    }));

    let params: Map<String, Value> = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .map(|Query(q)| q.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
        .unwrap_or_default();

    RequestInfo {
        action,
        uri: req.uri().path().to_owned(),
        params,
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_drop_slashes() {
        assert_eq!(action_name("/agent_test/index"), "agent_test/index");
        assert_eq!(action_name("agent_test/index/"), "agent_test/index");
    }
}
