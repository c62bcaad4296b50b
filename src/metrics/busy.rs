use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::names;
use super::queue_time::WorkerBacklog;
use super::store::MetricStore;
use crate::clock::{seconds_between, Clock};

/// Tracks how much of each harvest window the process spent serving
/// requests, and turns it into the `Instance/Busy` ratio at harvest.
///
/// Clones share the same window.
#[derive(Clone)]
pub struct BusyCalculator {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<BusyState>>,
}

struct BusyState {
    /// Busy seconds since `last_harvest_time`.
    accumulator: f64,
    last_harvest_time: DateTime<Utc>,
    /// Requests that started but have not finished, by request id.
    in_flight: HashMap<u64, DateTime<Utc>>,
}

impl BusyCalculator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            clock,
            state: Arc::new(Mutex::new(BusyState {
                accumulator: 0.0,
                last_harvest_time: now,
                in_flight: HashMap::new(),
            })),
        }
    }

    /// Start a fresh window at the current time.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.accumulator = 0.0;
        state.last_harvest_time = now;
        state.in_flight.clear();
    }

    /// Add the span `[start, end]` to the window. Anything before the last
    /// harvest was already counted there.
    pub fn record_busy(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.add_span(start, end);
    }

    pub fn dispatcher_start(&self, id: u64, at: DateTime<Utc>) {
        self.state.lock().in_flight.insert(id, at);
    }

    /// Close an in-flight span. Unknown ids are ignored.
    pub fn dispatcher_finish(&self, id: u64, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        if let Some(start) = state.in_flight.remove(&id) {
            state.add_span(start, at);
        }
    }

    /// The request was dropped before it finished. Whatever it ran up to
    /// now still counts as busy.
    pub fn abandon(&self, id: u64) {
        let now = self.clock.now();
        self.dispatcher_finish(id, now);
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Busy seconds accumulated so far in this window.
    pub fn accumulated(&self) -> f64 {
        self.state.lock().accumulator
    }

    /// Close the window: write the busy ratio to `Instance/Busy` and start
    /// the next window at now. Returns the ratio.
    pub fn harvest_busy(&self, store: &MetricStore) -> f64 {
        let now = self.clock.now();
        let ratio = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            // Requests still running own the tail of this window.
            let mut partial = 0.0;
            for start in state.in_flight.values_mut() {
                let from = (*start).max(state.last_harvest_time);
                partial += seconds_between(from, now).max(0.0);
                *start = now;
            }
            state.accumulator += partial;

            let window = seconds_between(state.last_harvest_time, now);
            let ratio = if window > 0.0 {
                (state.accumulator / window).clamp(0.0, 1.0)
            } else {
                0.0
            };

            state.accumulator = 0.0;
            state.last_harvest_time = now;
            ratio
        };

        store.record(names::INSTANCE_BUSY, ratio, ratio);
        ratio
    }
}

/// In-flight requests stand in for busy workers.
impl WorkerBacklog for BusyCalculator {
    fn busy_workers(&self) -> Option<usize> {
        Some(self.in_flight())
    }
}

impl BusyState {
    fn add_span(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let from = start.max(self.last_harvest_time);
        let secs = seconds_between(from, end);
        if secs > 0.0 {
            self.accumulator += secs;
        }
    }
}
