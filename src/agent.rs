//! # Agent
//!
//! The per-process engine. The host framework owns one `Agent` (usually in
//! an `Arc`) and drives it with explicit request notifications:
//!
//! 1. [`Agent::start_request`] returns a [`RequestContext`] that travels with
//!    the request; nothing is kept in thread-local storage.
//! 2. The handler may open and close trace segments on the context.
//! 3. [`Agent::finish_request`] folds everything into the shared store.
//!
//! [`Agent::harvest`] drains the store, busy window, response-time histogram
//! and retained trace into one [`HarvestSnapshot`].

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::clock::{seconds_between, Clock, SystemClock};
use crate::config::AgentConfig;
use crate::metrics::names;
use crate::metrics::percentiles::{PercentileSet, ResponseTimes};
use crate::metrics::queue_time::{QueueHeaders, QueueTimeExtractor};
use crate::metrics::stats::ApdexZone;
use crate::metrics::store::{ApdexRecord, MetricRecord, MetricStore};
use crate::metrics::{BusyCalculator, WorkerBacklog};
use crate::sampler::{SampleBuilder, SampleDetails, TransactionSample, TransactionSampler};

// ─── Request input ───────────────────────────────────────────────

/// What the host framework knows when a request arrives.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Transaction path, e.g. `agent_test/index`.
    pub action: String,
    pub uri: String,
    pub params: Map<String, Value>,
    pub headers: QueueHeaders,
}

impl RequestInfo {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: QueueHeaders) -> Self {
        self.headers = headers;
        self
    }
}

// ─── Per-request state ───────────────────────────────────────────

struct OpenSegment {
    name: String,
    started_at: DateTime<Utc>,
    child_time: f64,
}

struct FinishedSegment {
    name: String,
    duration: f64,
    exclusive: f64,
}

/// Correlation state for one request, passed explicitly through the call
/// chain. An untraced context accepts every call and records nothing.
pub struct RequestContext {
    id: u64,
    traced: bool,
    action: String,
    transaction_name: String,
    uri: String,
    params: Map<String, Value>,
    custom_params: Map<String, Value>,
    started_at: DateTime<Utc>,
    queue_time: f64,
    clock: Arc<dyn Clock>,
    /// Set while the request counts as in flight; taken when it finishes.
    busy: Option<BusyCalculator>,
    sample: Option<SampleBuilder>,
    open: Vec<OpenSegment>,
    finished: Vec<FinishedSegment>,
    /// Time spent in top-level segments.
    child_time: f64,
    cpu_time: Option<f64>,
}

impl RequestContext {
    fn untraced(action: String, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            id: 0,
            traced: false,
            transaction_name: names::controller(&action),
            action,
            uri: String::new(),
            params: Map::new(),
            custom_params: Map::new(),
            started_at,
            queue_time: 0.0,
            clock,
            busy: None,
            sample: None,
            open: Vec::new(),
            finished: Vec::new(),
            child_time: 0.0,
            cpu_time: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// `Controller/<action>`.
    pub fn transaction_name(&self) -> &str {
        &self.transaction_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Seconds spent in front-end queues before the request arrived.
    pub fn queue_time(&self) -> f64 {
        self.queue_time
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn add_custom_param(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if self.traced {
            self.custom_params.insert(key.into(), value.into());
        }
    }

    /// Add CPU seconds spent on this request. The host measures them; the
    /// total lands on `ControllerCPU/<action>`.
    pub fn record_cpu_time(&mut self, secs: f64) {
        if self.traced && secs.is_finite() && secs >= 0.0 {
            *self.cpu_time.get_or_insert(0.0) += secs;
        }
    }

    /// Open a nested timed segment, e.g. `View/agent_test/index`.
    pub fn push_segment(&mut self, name: impl Into<String>) {
        if !self.traced {
            return;
        }
        let name = name.into();
        let now = self.clock.now();
        if let Some(sample) = self.sample.as_mut() {
            sample.push_scope(name.clone(), now);
        }
        self.open.push(OpenSegment {
            name,
            started_at: now,
            child_time: 0.0,
        });
    }

    /// Close the innermost segment and return its duration in seconds.
    pub fn pop_segment(&mut self) -> Option<f64> {
        let segment = self.open.pop()?;
        let now = self.clock.now();
        let duration = seconds_between(segment.started_at, now).max(0.0);
        let exclusive = (duration - segment.child_time).max(0.0);

        match self.open.last_mut() {
            Some(parent) => parent.child_time += duration,
            None => self.child_time += duration,
        }
        if let Some(sample) = self.sample.as_mut() {
            sample.pop_scope(now);
        }
        self.finished.push(FinishedSegment {
            name: segment.name,
            duration,
            exclusive,
        });
        Some(duration)
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        // dropped without finish_request: cancelled, disconnected or panicked
        if let Some(busy) = self.busy.take() {
            debug!(transaction = %self.transaction_name, "request abandoned before finishing");
            busy.abandon(self.id);
        }
    }
}

// ─── Output ──────────────────────────────────────────────────────

/// Everything one harvest window produced.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestSnapshot {
    pub harvested_at: DateTime<Utc>,
    /// Seconds covered by this window.
    pub window_secs: f64,
    pub metrics: Vec<MetricRecord>,
    pub apdex: Vec<ApdexRecord>,
    pub samples: Vec<TransactionSample>,
    pub response_time: PercentileSet,
}

impl HarvestSnapshot {
    pub fn metric(&self, name: &str) -> Option<&MetricRecord> {
        self.metrics
            .iter()
            .find(|m| m.scope.is_none() && m.name == name)
    }

    pub fn apdex(&self, name: &str) -> Option<&ApdexRecord> {
        self.apdex.iter().find(|a| a.name == name)
    }
}

// ─── Agent ───────────────────────────────────────────────────────

pub struct Agent {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    store: MetricStore,
    busy: BusyCalculator,
    sampler: TransactionSampler,
    queue: QueueTimeExtractor,
    response_times: ResponseTimes,
    next_request_id: AtomicU64,
    window_start: Mutex<DateTime<Utc>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AgentConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let busy = BusyCalculator::new(clock.clone());
        let queue = if config.worker_backlog {
            QueueTimeExtractor::with_backlog(Arc::new(busy.clone()))
        } else {
            QueueTimeExtractor::new()
        };
        Self {
            sampler: TransactionSampler::new(config.sampler_settings()),
            busy,
            store: MetricStore::new(),
            queue,
            response_times: ResponseTimes::new(),
            next_request_id: AtomicU64::new(1),
            window_start: Mutex::new(now),
            config,
            clock,
        }
    }

    /// Report `Mongrel/Queue Length` from `backlog` for requests that carry
    /// no depth header.
    pub fn with_worker_backlog(mut self, backlog: Arc<dyn WorkerBacklog>) -> Self {
        self.queue = QueueTimeExtractor::with_backlog(backlog);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    pub fn sampler(&self) -> &TransactionSampler {
        &self.sampler
    }

    pub fn busy(&self) -> &BusyCalculator {
        &self.busy
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether `action` is excluded from instrumentation entirely.
    pub fn is_ignored(&self, action: &str) -> bool {
        self.config.is_ignored(action)
    }

    /// Begin a request. Returns `None` for excluded actions, in which case
    /// the caller must not report anything for this request.
    pub fn start_request(&self, info: RequestInfo) -> Option<RequestContext> {
        if self.is_ignored(&info.action) {
            debug!(action = %info.action, "action excluded from instrumentation");
            return None;
        }

        let now = self.clock.now();
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let transaction_name = names::controller(&info.action);

        self.busy.dispatcher_start(id, now);
        let queue_time = self.queue.record(&self.store, &info.headers, now);

        let sample = self.sampler.notice_first_scope_push(now).map(|mut builder| {
            builder.push_scope(transaction_name.clone(), now);
            builder
        });

        Some(RequestContext {
            id,
            traced: true,
            action: info.action,
            transaction_name,
            uri: info.uri,
            params: info.params,
            custom_params: Map::new(),
            started_at: now,
            queue_time,
            clock: self.clock.clone(),
            busy: Some(self.busy.clone()),
            sample,
            open: Vec::new(),
            finished: Vec::new(),
            child_time: 0.0,
            cpu_time: None,
        })
    }

    /// End a request. `error` is whatever the unit of work failed with; it
    /// is counted, never consumed. Returns the request duration in seconds.
    pub fn finish_request(&self, mut ctx: RequestContext, error: Option<&dyn Display>) -> f64 {
        if !ctx.traced {
            return 0.0;
        }
        while ctx.pop_segment().is_some() {}

        let now = self.clock.now();
        let duration = seconds_between(ctx.started_at, now).max(0.0);
        let exclusive = (duration - ctx.child_time).max(0.0);
        let scope = ctx.transaction_name.as_str();

        self.store.record(names::HTTP_DISPATCHER, duration, duration);
        self.store.record(scope, duration, exclusive);
        for segment in &ctx.finished {
            self.store.record(&segment.name, segment.duration, segment.exclusive);
            self.store
                .record_scoped(&segment.name, scope, segment.duration, segment.exclusive);
        }

        if let Some(cpu) = ctx.cpu_time {
            self.store.record(&names::controller_cpu(&ctx.action), cpu, cpu);
        }

        if !self.config.is_apdex_ignored(&ctx.action) {
            let zone = ApdexZone::classify(duration, error.is_some(), self.config.apdex_t);
            self.store.record_apdex(names::APDEX, zone);
            self.store.record_apdex(&names::apdex(&ctx.action), zone);
        }

        if let Some(err) = error {
            debug!(transaction = scope, error = %err, "request failed");
            self.store.increment(names::ERRORS_ALL);
            self.store.increment(&names::errors(&ctx.action));
        }

        if let Some(busy) = ctx.busy.take() {
            busy.dispatcher_finish(ctx.id, now);
        }
        self.response_times.record(duration);

        if let Some(builder) = ctx.sample.take() {
            let details = SampleDetails {
                transaction_name: ctx.transaction_name.clone(),
                uri: std::mem::take(&mut ctx.uri),
                request_params: std::mem::take(&mut ctx.params),
                custom_params: std::mem::take(&mut ctx.custom_params),
                queue_time: ctx.queue_time,
            };
            self.sampler.notice_scope_empty(builder, now, details);
        }

        duration
    }

    /// Run `work` as one instrumented request. An `Err` is recorded on the
    /// error metrics and handed back to the caller unchanged.
    pub fn instrument<T, E, F>(&self, info: RequestInfo, work: F) -> Result<T, E>
    where
        E: Display,
        F: FnOnce(&mut RequestContext) -> Result<T, E>,
    {
        let action = info.action.clone();
        let Some(mut ctx) = self.start_request(info) else {
            let mut ctx = RequestContext::untraced(action, self.clock.clone());
            return work(&mut ctx);
        };

        let result = work(&mut ctx);
        match &result {
            Ok(_) => self.finish_request(ctx, None),
            Err(err) => self.finish_request(ctx, Some(err as &dyn Display)),
        };
        result
    }

    /// Live view of the current window. Nothing is reset.
    pub fn snapshot(&self) -> HarvestSnapshot {
        let now = self.clock.now();
        let window_secs = seconds_between(*self.window_start.lock(), now).max(0.0);
        let contents = self.store.snapshot();
        HarvestSnapshot {
            harvested_at: now,
            window_secs,
            metrics: contents.metrics,
            apdex: contents.apdex,
            samples: self.sampler.retained().into_iter().collect(),
            response_time: self.response_times.snapshot(),
        }
    }

    /// Close the window: record `Instance/Busy`, drain every accumulator and
    /// return what they held.
    pub fn harvest(&self) -> HarvestSnapshot {
        self.harvest_with(None)
    }

    /// Like [`harvest`](Self::harvest), with the sample reported last time so
    /// the sampler policy can carry it into this window.
    pub fn harvest_with(&self, previous: Option<TransactionSample>) -> HarvestSnapshot {
        let now = self.clock.now();
        let busy = self.busy.harvest_busy(&self.store);
        let contents = self.store.harvest();
        let samples = self.sampler.harvest(previous);
        let response_time = self.response_times.harvest();

        let window_secs = {
            let mut start = self.window_start.lock();
            let secs = seconds_between(*start, now).max(0.0);
            *start = now;
            secs
        };

        info!(
            metrics = contents.metrics.len(),
            apdex = contents.apdex.len(),
            samples = samples.len(),
            busy,
            window_secs,
            "harvested"
        );

        HarvestSnapshot {
            harvested_at: now,
            window_secs,
            metrics: contents.metrics,
            apdex: contents.apdex,
            samples,
            response_time,
        }
    }

    /// Forget every metric without reporting it. Traces and the busy window
    /// are left alone.
    pub fn clear_stats(&self) {
        self.store.clear();
    }
}

/// Back-to-back harvests where each window's reported sample is offered to
/// the next, so the sampler policy holds across windows.
#[derive(Default)]
pub struct HarvestCycle {
    reported: Option<TransactionSample>,
}

impl HarvestCycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn harvest(&mut self, agent: &Agent) -> HarvestSnapshot {
        let snapshot = agent.harvest_with(self.reported.take());
        self.reported = snapshot.samples.last().cloned();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sampler::FILTERED;

    const PATH: &str = "agent_test/index";

    fn agent_with(config: AgentConfig) -> (Arc<ManualClock>, Agent) {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_360_973_845));
        let agent = Agent::with_clock(config, clock.clone());
        (clock, agent)
    }

    fn agent() -> (Arc<ManualClock>, Agent) {
        agent_with(AgentConfig::default())
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn successful_request_records_dispatcher_controller_and_apdex() {
        let (clock, agent) = agent();
        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        clock.advance_secs_f64(0.2);
        let duration = agent.finish_request(ctx, None);

        assert!((duration - 0.2).abs() < 1e-9);
        let store = agent.store();
        assert_eq!(store.get_stats_no_scope(names::HTTP_DISPATCHER).unwrap().call_count, 1);
        assert_eq!(store.get_stats_no_scope("Controller/agent_test/index").unwrap().call_count, 1);
        let apdex = store.lookup_apdex("Apdex/agent_test/index").unwrap();
        assert_eq!(apdex.satisfied, 1);
        assert!(store.get_stats_no_scope(names::ERRORS_ALL).is_none());
    }

    #[test]
    fn failing_unit_records_errors_and_propagates() {
        let (_clock, agent) = agent();
        let action = "agent_test/action_with_error";
        let result: Result<(), String> =
            agent.instrument(RequestInfo::new(action), |_| Err("boom".to_string()));

        assert_eq!(result, Err("boom".to_string()));
        let expected = sorted(vec![
            "Apdex".into(),
            "Apdex/agent_test/action_with_error".into(),
            "HttpDispatcher".into(),
            "Controller/agent_test/action_with_error".into(),
            "Errors/all".into(),
            "Errors/Controller/agent_test/action_with_error".into(),
        ]);
        assert_eq!(agent.store().metrics(), expected);

        let store = agent.store();
        assert_eq!(store.get_stats_no_scope(names::ERRORS_ALL).unwrap().call_count, 1);
        assert_eq!(
            store
                .get_stats_no_scope("Errors/Controller/agent_test/action_with_error")
                .unwrap()
                .call_count,
            1
        );
        let apdex = store.lookup_apdex(names::APDEX).unwrap();
        assert_eq!((apdex.satisfied, apdex.tolerating, apdex.failing), (0, 0, 1));
    }

    #[test]
    fn ignored_action_records_nothing() {
        let mut config = AgentConfig::default();
        config.ignored_actions.insert("agent_test/action_to_ignore".into());
        let (_clock, agent) = agent_with(config);

        assert!(agent
            .start_request(RequestInfo::new("agent_test/action_to_ignore"))
            .is_none());
        let out: Result<u32, String> =
            agent.instrument(RequestInfo::new("agent_test/action_to_ignore"), |ctx| {
                ctx.push_segment("View/ignored");
                ctx.pop_segment();
                Ok(7)
            });
        assert_eq!(out, Ok(7));
        assert!(agent.store().metrics().is_empty());
        assert!(agent.sampler().samples().is_empty());
    }

    #[test]
    fn apdex_ignored_action_still_records_controller() {
        let action = "agent_test/action_to_ignore_apdex";
        let mut config = AgentConfig::default();
        config.apdex_ignored_actions.insert(action.into());
        let (_clock, agent) = agent_with(config);

        let controller = agent.store().get_or_create("Controller/agent_test/action_to_ignore_apdex");
        let apdex = agent.store().get_or_create_apdex("Apdex/agent_test/action_to_ignore_apdex");
        let ctx = agent.start_request(RequestInfo::new(action)).unwrap();
        agent.finish_request(ctx, None);

        assert_eq!(controller.call_count(), 1);
        assert_eq!(apdex.count(), 0);
    }

    #[test]
    fn segments_are_recorded_scoped_and_unscoped() {
        let (clock, agent) = agent();
        let mut ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        clock.advance_secs_f64(0.1);
        ctx.push_segment("View/agent_test/index");
        clock.advance_secs_f64(0.3);
        assert!((ctx.pop_segment().unwrap() - 0.3).abs() < 1e-9);
        clock.advance_secs_f64(0.1);
        agent.finish_request(ctx, None);

        let store = agent.store();
        let controller = store.get_stats_no_scope("Controller/agent_test/index").unwrap();
        assert!((controller.total_call_time - 0.5).abs() < 1e-9);
        assert!((controller.total_exclusive_time - 0.2).abs() < 1e-9);
        assert_eq!(store.get_stats_no_scope("View/agent_test/index").unwrap().call_count, 1);
        assert_eq!(
            store
                .lookup_scoped("View/agent_test/index", "Controller/agent_test/index")
                .unwrap()
                .call_count,
            1
        );
    }

    #[test]
    fn queue_headers_feed_metrics_and_sample() {
        let mut config = AgentConfig::default();
        config.transaction_tracer.transaction_threshold = Some(0.0);
        let (clock, agent) = agent_with(config);
        let start = format!("t={}", (1_360_973_845 - 1) * 1_000_000i64);
        let headers = QueueHeaders::from_pairs([("HTTP_X_QUEUE_START", start)]);

        let ctx = agent
            .start_request(RequestInfo::new(PATH).with_headers(headers))
            .unwrap();
        assert!((ctx.queue_time() - 1.0).abs() < 1e-6);
        clock.advance_secs_f64(0.05);
        agent.finish_request(ctx, None);

        let wait = agent.store().get_stats_no_scope(names::QUEUE_TIME).unwrap();
        assert_eq!(wait.call_count, 1);
        let sample = agent.sampler().retained().unwrap();
        assert_eq!(sample.params["queue_time"], Value::from(1.0));
    }

    #[test]
    fn no_headers_no_queue_metrics() {
        let (_clock, agent) = agent();
        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        agent.finish_request(ctx, None);
        assert!(agent.store().lookup_stats(names::QUEUE_TIME).is_none());
        assert!(agent.store().lookup_stats(names::QUEUE_LENGTH).is_none());
    }

    #[test]
    fn sample_params_are_filtered_and_complete() {
        let mut config = AgentConfig::default();
        config.transaction_tracer.transaction_threshold = Some(0.0);
        let (_clock, agent) = agent_with(config);
        agent.sampler().reset();

        let info = RequestInfo::new(PATH)
            .with_uri("/agent_test/index")
            .with_param("social_security_number", "001-555-1212")
            .with_param("number", "001-555-1212");
        let ctx = agent.start_request(info).unwrap();
        agent.finish_request(ctx, None);

        let harvested = agent.sampler().harvest(None);
        assert_eq!(harvested.len(), 1);
        let sample = &harvested[0];
        assert_eq!(sample.params.len(), 5);
        let params = sample.request_params().unwrap();
        assert_eq!(params["social_security_number"], FILTERED);
        assert_eq!(params["number"], "001-555-1212");
        assert_eq!(sample.root.children[0].metric_name, "Controller/agent_test/index");
    }

    #[test]
    fn error_does_not_prevent_sample() {
        let mut config = AgentConfig::default();
        config.transaction_tracer.transaction_threshold = Some(0.0);
        let (_clock, agent) = agent_with(config);
        let _: Result<(), &str> = agent.instrument(RequestInfo::new(PATH), |_| Err("nope"));
        assert_eq!(agent.sampler().samples().len(), 1);
    }

    #[test]
    fn harvest_drains_everything() {
        let mut config = AgentConfig::default();
        config.transaction_tracer.transaction_threshold = Some(0.0);
        let (clock, agent) = agent_with(config);

        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        clock.advance_secs_f64(1.0);
        agent.finish_request(ctx, None);
        clock.advance_secs_f64(1.0);

        let snap = agent.harvest();
        assert!((snap.window_secs - 2.0).abs() < 1e-9);
        assert_eq!(snap.metric(names::HTTP_DISPATCHER).unwrap().stats.call_count, 1);
        let busy = snap.metric(names::INSTANCE_BUSY).unwrap().stats;
        assert!((busy.total_call_time - 0.5).abs() < 1e-9);
        assert_eq!(snap.apdex(names::APDEX).unwrap().apdex.count(), 1);
        assert_eq!(snap.samples.len(), 1);
        assert_eq!(snap.response_time.count, 1);

        assert!(agent.store().metrics().is_empty());
        let next = agent.harvest();
        assert!(next.samples.is_empty());
        assert_eq!(next.metric(names::INSTANCE_BUSY).unwrap().stats.total_call_time, 0.0);
    }

    #[test]
    fn snapshot_does_not_reset() {
        let (_clock, agent) = agent();
        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        agent.finish_request(ctx, None);
        let snap = agent.snapshot();
        assert!(snap.metric(names::HTTP_DISPATCHER).is_some());
        assert_eq!(agent.store().metrics().len(), snap.metrics.len() + snap.apdex.len());
    }

    #[test]
    fn clear_stats_empties_metrics() {
        let (_clock, agent) = agent();
        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        agent.finish_request(ctx, None);
        agent.clear_stats();
        assert!(agent.store().metrics().is_empty());
        assert!(agent.store().lookup_stats("Controller/agent_test/index").is_none());
    }

    #[test]
    fn dropped_context_is_no_longer_in_flight() {
        let (clock, agent) = agent();
        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        assert_eq!(agent.busy().in_flight(), 1);
        clock.advance_secs_f64(1.0);
        drop(ctx);
        assert_eq!(agent.busy().in_flight(), 0);
        assert!((agent.busy().accumulated() - 1.0).abs() < 1e-9);
        assert!(agent.store().lookup_stats(names::HTTP_DISPATCHER).is_none());

        // the abandoned request does not keep later idle windows busy
        agent.harvest();
        clock.advance_secs_f64(3.0);
        let idle = agent.harvest();
        assert_eq!(idle.metric(names::INSTANCE_BUSY).unwrap().stats.total_call_time, 0.0);
    }

    #[test]
    fn finished_context_is_not_abandoned_twice() {
        let (clock, agent) = agent();
        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        clock.advance_secs_f64(0.5);
        agent.finish_request(ctx, None);
        assert_eq!(agent.busy().in_flight(), 0);
        assert!((agent.busy().accumulated() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn cpu_time_is_recorded_for_apdex_ignored_actions() {
        let action = "agent_test/action_to_ignore_apdex";
        let mut config = AgentConfig::default();
        config.apdex_ignored_actions.insert(action.into());
        let (_clock, agent) = agent_with(config);

        let mut ctx = agent.start_request(RequestInfo::new(action)).unwrap();
        ctx.record_cpu_time(0.02);
        ctx.record_cpu_time(0.01);
        ctx.record_cpu_time(f64::NAN);
        agent.finish_request(ctx, None);

        let cpu = agent
            .store()
            .get_stats_no_scope("ControllerCPU/agent_test/action_to_ignore_apdex")
            .unwrap();
        assert_eq!(cpu.call_count, 1);
        assert!((cpu.total_call_time - 0.03).abs() < 1e-9);
        assert!(agent.store().lookup_apdex("Apdex/agent_test/action_to_ignore_apdex").is_none());
    }

    #[test]
    fn no_cpu_time_no_cpu_metric() {
        let (_clock, agent) = agent();
        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        agent.finish_request(ctx, None);
        assert!(agent
            .store()
            .metrics()
            .iter()
            .all(|m| !m.starts_with("ControllerCPU/")));
    }

    #[test]
    fn worker_backlog_counts_other_requests() {
        let mut config = AgentConfig::default();
        config.worker_backlog = true;
        let (_clock, agent) = agent_with(config);

        let first = agent.start_request(RequestInfo::new(PATH)).unwrap();
        let second = agent.start_request(RequestInfo::new(PATH)).unwrap();
        agent.finish_request(second, None);
        agent.finish_request(first, None);

        let depth = agent.store().get_stats_no_scope(names::QUEUE_LENGTH).unwrap();
        assert_eq!(depth.call_count, 2);
        assert_eq!(depth.total_call_time, 1.0);
    }

    #[test]
    fn explicit_worker_backlog_source() {
        struct Mongrel;
        impl WorkerBacklog for Mongrel {
            fn busy_workers(&self) -> Option<usize> {
                Some(10)
            }
        }
        let (_clock, agent) = agent();
        let agent = agent.with_worker_backlog(Arc::new(Mongrel));
        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        agent.finish_request(ctx, None);

        let depth = agent.store().get_stats_no_scope(names::QUEUE_LENGTH).unwrap();
        assert_eq!((depth.call_count, depth.total_call_time), (1, 9.0));
        assert!(agent.store().lookup_stats(names::QUEUE_TIME).is_none());
    }

    #[test]
    fn harvest_with_previous_keeps_the_slowest() {
        let mut config = AgentConfig::default();
        config.transaction_tracer.transaction_threshold = Some(0.0);
        let (clock, agent) = agent_with(config);

        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        clock.advance_secs_f64(2.0);
        agent.finish_request(ctx, None);
        let first = agent.harvest_with(None);
        let slow = first.samples.last().cloned().unwrap();

        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        clock.advance_secs_f64(0.5);
        agent.finish_request(ctx, None);
        let second = agent.harvest_with(Some(slow.clone()));
        assert_eq!(second.samples.len(), 1);
        assert_eq!(second.samples[0].guid, slow.guid);

        // nothing new: the previous sample is reported again
        let third = agent.harvest_with(second.samples.last().cloned());
        assert_eq!(third.samples[0].guid, slow.guid);
    }

    #[test]
    fn harvest_cycle_offers_each_sample_to_the_next_window() {
        let mut config = AgentConfig::default();
        config.transaction_tracer.transaction_threshold = Some(0.0);
        let (clock, agent) = agent_with(config);
        let mut cycle = HarvestCycle::new();

        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        clock.advance_secs_f64(1.5);
        agent.finish_request(ctx, None);
        let slow = cycle.harvest(&agent).samples[0].guid;

        let ctx = agent.start_request(RequestInfo::new("agent_test/action_inline")).unwrap();
        clock.advance_secs_f64(0.1);
        agent.finish_request(ctx, None);
        let next = cycle.harvest(&agent);
        assert_eq!(next.samples.len(), 1);
        assert_eq!(next.samples[0].guid, slow);

        let ctx = agent.start_request(RequestInfo::new(PATH)).unwrap();
        clock.advance_secs_f64(3.0);
        agent.finish_request(ctx, None);
        let slower = cycle.harvest(&agent);
        assert_ne!(slower.samples[0].guid, slow);
        assert!((slower.samples[0].duration - 3.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_requests() {
        let (_clock, agent) = agent();
        let agent = Arc::new(agent);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let agent = agent.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        let info = RequestInfo::new(PATH);
                        let _: Result<(), String> = agent.instrument(info, |_| {
                            if (i + j) % 10 == 0 {
                                Err("fail".into())
                            } else {
                                Ok(())
                            }
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let store = agent.store();
        assert_eq!(store.get_stats_no_scope(names::HTTP_DISPATCHER).unwrap().call_count, 800);
        assert_eq!(store.get_stats_no_scope(names::ERRORS_ALL).unwrap().call_count, 80);
        assert_eq!(store.lookup_apdex(names::APDEX).unwrap().count(), 800);
        assert_eq!(agent.busy().in_flight(), 0);
    }
}
