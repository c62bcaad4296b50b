//! # Transaction Sampler
//!
//! Captures one trace per request (call tree plus filtered parameters) and
//! keeps the sample worth reporting for the current harvest window.
//!
//! The per-request [`SampleBuilder`] lives in the request context; only the
//! finished sample crosses into shared state.

pub mod filter;
pub mod segment;

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use filter::{ParameterFilter, FILTERED};
pub use segment::{SampleBuilder, Segment};

/// How many finished samples `samples()` remembers.
const MAX_RECENT_SAMPLES: usize = 100;

/// Which over-threshold sample survives until the next harvest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplePolicy {
    /// Keep the longest sample seen in the window.
    #[default]
    Slowest,
    /// Keep the last sample that crossed the threshold.
    MostRecent,
}

/// A finished transaction trace.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSample {
    pub guid: Uuid,
    pub timestamp: DateTime<Utc>,
    pub transaction_name: String,
    /// Seconds.
    pub duration: f64,
    pub params: BTreeMap<String, Value>,
    pub root: Segment,
}

impl TransactionSample {
    pub fn request_params(&self) -> Option<&Map<String, Value>> {
        self.params.get("request_params").and_then(Value::as_object)
    }
}

/// What the instrumentation layer knows about a request when it ends.
#[derive(Debug, Clone, Default)]
pub struct SampleDetails {
    pub transaction_name: String,
    pub uri: String,
    pub request_params: Map<String, Value>,
    pub custom_params: Map<String, Value>,
    pub queue_time: f64,
}

#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub enabled: bool,
    /// Seconds; samples at or above this are retained for harvest.
    pub threshold: f64,
    pub policy: SamplePolicy,
    pub filter: ParameterFilter,
}

#[derive(Default)]
struct SamplerState {
    retained: Option<TransactionSample>,
    recent: VecDeque<TransactionSample>,
}

pub struct TransactionSampler {
    settings: SamplerSettings,
    state: Mutex<SamplerState>,
}

impl TransactionSampler {
    pub fn new(settings: SamplerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(SamplerState::default()),
        }
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    /// Drop the retained sample and the recent list.
    pub fn reset(&self) {
        *self.state.lock() = SamplerState::default();
    }

    /// Open a sample for a request that starts at `at`. `None` when tracing
    /// is disabled.
    pub fn notice_first_scope_push(&self, at: DateTime<Utc>) -> Option<SampleBuilder> {
        self.settings.enabled.then(|| SampleBuilder::new(at))
    }

    /// Finish the sample. It always joins the recent list; whether it is
    /// retained for harvest depends on the threshold and policy.
    pub fn notice_scope_empty(
        &self,
        builder: SampleBuilder,
        at: DateTime<Utc>,
        details: SampleDetails,
    ) -> TransactionSample {
        let started_at = builder.started_at();
        let (root, duration) = builder.finish(at);
        let guid = Uuid::new_v4();

        let mut params = BTreeMap::new();
        params.insert("uri".to_owned(), Value::String(details.uri));
        params.insert(
            "request_params".to_owned(),
            Value::Object(self.settings.filter.filter_map(&details.request_params)),
        );
        params.insert(
            "custom_params".to_owned(),
            Value::Object(self.settings.filter.filter_map(&details.custom_params)),
        );
        params.insert("queue_time".to_owned(), Value::from(details.queue_time));
        params.insert("transaction_guid".to_owned(), Value::String(guid.to_string()));

        let sample = TransactionSample {
            guid,
            timestamp: started_at,
            transaction_name: details.transaction_name,
            duration,
            params,
            root,
        };

        let mut state = self.state.lock();
        if duration >= self.settings.threshold {
            let replace = match (&state.retained, self.settings.policy) {
                (None, _) => true,
                (Some(_), SamplePolicy::MostRecent) => true,
                (Some(kept), SamplePolicy::Slowest) => duration > kept.duration,
            };
            if replace {
                state.retained = Some(sample.clone());
            }
        }
        state.recent.push_back(sample.clone());
        if state.recent.len() > MAX_RECENT_SAMPLES {
            state.recent.pop_front();
        }
        sample
    }

    /// Recently finished samples, oldest first.
    pub fn samples(&self) -> Vec<TransactionSample> {
        self.state.lock().recent.iter().cloned().collect()
    }

    pub fn retained(&self) -> Option<TransactionSample> {
        self.state.lock().retained.clone()
    }

    /// Hand over the retained sample and clear it. `previous` is the sample
    /// reported last time; under the slowest policy it is carried forward
    /// when nothing slower has been seen since.
    pub fn harvest(&self, previous: Option<TransactionSample>) -> Vec<TransactionSample> {
        let current = self.state.lock().retained.take();
        let chosen = match (current, previous, self.settings.policy) {
            (Some(cur), Some(prev), SamplePolicy::Slowest) if prev.duration > cur.duration => {
                Some(prev)
            }
            (Some(cur), _, _) => Some(cur),
            (None, prev, SamplePolicy::Slowest) => prev,
            (None, _, SamplePolicy::MostRecent) => None,
        };
        chosen.into_iter().collect()
    }
}
