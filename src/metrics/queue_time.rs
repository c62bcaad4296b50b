//! # Front-end Queue Headers
//!
//! Load balancers and routers stamp requests before they reach the app.
//! Three dialects are understood:
//!
//! - Heroku's queue depth (`X-Heroku-Queue-Depth: 15`), recorded as a
//!   magnitude on `Mongrel/Queue Length`.
//! - Apache/nginx style start stamps (`X-Request-Start`, `X-Queue-Start`,
//!   `X-Middleware-Start`, value `t=<epoch micros>`), each recorded as one
//!   wait on `WebFrontend/QueueTime`.
//!
//! A fourth source needs no headers: an injected [`WorkerBacklog`] reports
//! how many workers are busy, and everyone but the current request counts as
//! queue length. It only applies when no depth header was sent.
//!
//! Header names are matched in both CGI form (`HTTP_X_QUEUE_START`) and wire
//! form (`X-Queue-Start`). Malformed values never raise; they are skipped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::names;
use super::store::MetricStore;
use crate::clock::epoch_seconds;

/// The start-stamp headers, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartHeader {
    RequestStart,
    QueueStart,
    MiddlewareStart,
}

impl StartHeader {
    pub const ALL: [StartHeader; 3] = [
        StartHeader::RequestStart,
        StartHeader::QueueStart,
        StartHeader::MiddlewareStart,
    ];

    /// Normalized header name.
    pub fn key(self) -> &'static str {
        match self {
            StartHeader::RequestStart => "X_REQUEST_START",
            StartHeader::QueueStart => "X_QUEUE_START",
            StartHeader::MiddlewareStart => "X_MIDDLEWARE_START",
        }
    }
}

const DEPTH_HEADER: &str = "X_HEROKU_QUEUE_DEPTH";

/// One thing learned from the headers of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueueObservation {
    /// Requests waiting behind this one.
    Depth(u64),
    /// Seconds between a front-end stamp and now.
    Wait { header: StartHeader, seconds: f64 },
}

/// Header map with names normalized to `X_QUEUE_START` form.
#[derive(Debug, Default, Clone)]
pub struct QueueHeaders {
    values: HashMap<String, String>,
}

impl QueueHeaders {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (normalize(k.as_ref()), v.into()))
            .collect();
        Self { values }
    }

    pub fn get(&self, normalized: &str) -> Option<&str> {
        self.values.get(normalized).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// `x-queue-start` / `HTTP_X_QUEUE_START` → `X_QUEUE_START`.
pub fn normalize(name: &str) -> String {
    let upper = name.trim().to_ascii_uppercase().replace('-', "_");
    match upper.strip_prefix("HTTP_") {
        Some(rest) => rest.to_owned(),
        None => upper,
    }
}

/// Number of request workers currently busy, the current request included.
pub trait WorkerBacklog: Send + Sync {
    fn busy_workers(&self) -> Option<usize>;
}

/// Parser for the queue header dialects, optionally backed by a worker
/// backlog source.
#[derive(Clone, Default)]
pub struct QueueTimeExtractor {
    backlog: Option<Arc<dyn WorkerBacklog>>,
}

impl QueueTimeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backlog(backlog: Arc<dyn WorkerBacklog>) -> Self {
        Self {
            backlog: Some(backlog),
        }
    }

    /// Every observation the headers support, depth first.
    pub fn extract(&self, headers: &QueueHeaders, now: DateTime<Utc>) -> Vec<QueueObservation> {
        let mut found = Vec::new();

        let depth = headers.get(DEPTH_HEADER).and_then(parse_depth).or_else(|| {
            self.backlog
                .as_ref()
                .and_then(|b| b.busy_workers())
                .map(|busy| busy.saturating_sub(1) as u64)
        });
        if let Some(depth) = depth {
            found.push(QueueObservation::Depth(depth));
        }

        let now_secs = epoch_seconds(now);
        for header in StartHeader::ALL {
            let Some(raw) = headers.get(header.key()) else {
                continue;
            };
            match parse_start(raw) {
                Some(start) if start <= now_secs => {
                    found.push(QueueObservation::Wait {
                        header,
                        seconds: now_secs - start,
                    });
                }
                Some(_) => debug!(header = header.key(), raw, "queue start is in the future, ignoring"),
                None => debug!(header = header.key(), raw, "unparseable queue start, ignoring"),
            }
        }

        found
    }

    /// Extract and record. Returns the summed wait time in seconds.
    pub fn record(&self, store: &MetricStore, headers: &QueueHeaders, now: DateTime<Utc>) -> f64 {
        let mut waited = 0.0;
        for observation in self.extract(headers, now) {
            match observation {
                QueueObservation::Depth(depth) => {
                    let magnitude = depth as f64;
                    store.record(names::QUEUE_LENGTH, magnitude, magnitude);
                }
                QueueObservation::Wait { seconds, .. } => {
                    store.record(names::QUEUE_TIME, seconds, seconds);
                    waited += seconds;
                }
            }
        }
        waited
    }
}

fn parse_depth(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse().ok()
}

/// `t=1360973844000000` (micros) or `t=1360973844.25` (seconds), with or
/// without the `t=` prefix. Returns epoch seconds.
fn parse_start(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let value = raw.strip_prefix("t=").unwrap_or(raw).trim();
    if value.is_empty() {
        return None;
    }
    if value.contains('.') {
        let secs: f64 = value.parse().ok()?;
        return (secs.is_finite() && secs > 0.0).then_some(secs);
    }
    let micros: u64 = value.parse().ok()?;
    (micros > 0).then(|| micros as f64 / 1e6)
}
