use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::agent::HarvestSnapshot;
use crate::AppState;

// ─── GET /api/metrics ────────────────────────────────────────────
/// Live view of the current harvest window, for curl and debugging.
/// Nothing is reset.

pub async fn get_metrics(
    State(state): State<Arc<AppState>>,
) -> Json<HarvestSnapshot> {
    Json(state.agent.snapshot())
}

// ─── POST /api/harvest ───────────────────────────────────────────
/// Close the window and return everything it accumulated.

pub async fn harvest(
    State(state): State<Arc<AppState>>,
) -> Json<HarvestSnapshot> {
    Json(state.harvest())
}

// ─── GET /api/metrics/stream ─────────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes the live snapshot as JSON every 500 ms.

pub async fn metrics_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(Duration::from_millis(500));

    let stream = IntervalStream::new(interval).map(move |_| {
        let snapshot = state.agent.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
