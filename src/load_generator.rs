//! Synthetic traffic reported straight to the agent, without going through
//! HTTP. Useful for watching the live metrics stream move.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::agent::{Agent, RequestInfo};
use crate::clock::epoch_seconds;
use crate::metrics::QueueHeaders;

/// Synthetic transactions the workers pick from.
const ACTIONS: &[&str] = &[
    "load/users/show",
    "load/users/create",
    "load/products/show",
    "load/sessions/create",
];

const MAX_CONCURRENCY: u32 = 500;
const MAX_DURATION_SECS: u64 = 300;

// ─── Settings ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LoadSettings {
    /// Worker tasks reporting requests in parallel
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_duration")]
    pub duration_secs: u64,

    /// Share of requests that fail, in percent
    #[serde(default = "default_error_pct")]
    pub error_pct: u8,

    /// Share of requests stamped with `X-Request-Start`, in percent
    #[serde(default = "default_queue_header_pct")]
    pub queue_header_pct: u8,
}

fn default_concurrency() -> u32 {
    10
}
fn default_duration() -> u64 {
    30
}
fn default_error_pct() -> u8 {
    5
}
fn default_queue_header_pct() -> u8 {
    33
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            duration_secs: default_duration(),
            error_pct: default_error_pct(),
            queue_header_pct: default_queue_header_pct(),
        }
    }
}

impl LoadSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_CONCURRENCY).contains(&self.concurrency) {
            return Err(format!("concurrency must be between 1 and {MAX_CONCURRENCY}"));
        }
        if !(1..=MAX_DURATION_SECS).contains(&self.duration_secs) {
            return Err(format!("duration_secs must be between 1 and {MAX_DURATION_SECS}"));
        }
        if self.error_pct > 100 || self.queue_header_pct > 100 {
            return Err("percentages must be between 0 and 100".into());
        }
        Ok(())
    }
}

// ─── Controller ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct LoadStatus {
    pub running: bool,
    pub requests_sent: u64,
    pub requests_failed: u64,
    /// Requests the agent currently sees in flight, synthetic or not.
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
}

/// Owns at most one running load.
#[derive(Default)]
pub struct LoadController {
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LoadController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a load unless one is already running. Exactly one of any
    /// number of concurrent callers wins.
    pub fn try_start(&self, agent: Arc<Agent>, settings: LoadSettings) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.counters.sent.store(0, Ordering::Relaxed);
        self.counters.failed.store(0, Ordering::Relaxed);

        let running = self.running.clone();
        let counters = self.counters.clone();
        let handle = tokio::spawn(run(running, counters, agent, settings));
        *self.task.lock() = Some(handle);
        true
    }

    /// Stop the load and wait for every worker to report its last request.
    /// Returns whether anything was running.
    pub async fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            // the task may have finished on its own
            let _ = handle.await;
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self, agent: &Agent) -> LoadStatus {
        LoadStatus {
            running: self.is_running(),
            requests_sent: self.counters.sent.load(Ordering::Relaxed),
            requests_failed: self.counters.failed.load(Ordering::Relaxed),
            in_flight: agent.busy().in_flight(),
        }
    }
}

// ─── Workers ─────────────────────────────────────────────────────

async fn run(
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    agent: Arc<Agent>,
    settings: LoadSettings,
) {
    let deadline = Instant::now() + Duration::from_secs(settings.duration_secs);

    let handles: Vec<_> = (0..settings.concurrency)
        .map(|worker_id| {
            let running = running.clone();
            let counters = counters.clone();
            let agent = agent.clone();
            let settings = settings.clone();
            tokio::spawn(async move {
                // deterministic per worker
                let mut rng = StdRng::seed_from_u64(1000 + u64::from(worker_id));
                while running.load(Ordering::Relaxed) && Instant::now() < deadline {
                    let failed = one_request(&mut rng, &agent, &settings).await;
                    counters.sent.fetch_add(1, Ordering::Relaxed);
                    if failed {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        let _ = h.await;
    }

    running.store(false, Ordering::SeqCst);
    info!(
        requests = counters.sent.load(Ordering::Relaxed),
        failed = counters.failed.load(Ordering::Relaxed),
        "load generator finished"
    );
}

/// Report one synthetic request. Returns whether it failed.
async fn one_request(rng: &mut StdRng, agent: &Agent, settings: &LoadSettings) -> bool {
    let action = ACTIONS[rng.gen_range(0..ACTIONS.len())];

    let headers = if rng.gen_range(0u8..100) < settings.queue_header_pct {
        let queued_secs = rng.gen_range(0.001..0.050);
        let stamped = epoch_seconds(agent.now()) - queued_secs;
        QueueHeaders::from_pairs([("X-Request-Start", format!("t={}", (stamped * 1e6) as u64))])
    } else {
        QueueHeaders::default()
    };

    let info = RequestInfo::new(action)
        .with_uri(format!("/{action}"))
        .with_param("id", rng.gen_range(1..=10_000u32))
        .with_headers(headers);

    let Some(mut ctx) = agent.start_request(info) else {
        return false;
    };

    let work_ms = rng.gen_range(1..20u64);
    ctx.push_segment("Datastore/redis/get");
    tokio::time::sleep(Duration::from_millis(work_ms)).await;
    ctx.pop_segment();
    // most of a datastore call is spent waiting
    ctx.record_cpu_time(work_ms as f64 / 1e3 * rng.gen_range(0.05..0.3));

    let failure: &dyn Display = &"synthetic failure";
    let failed = rng.gen_range(0u8..100) < settings.error_pct;
    agent.finish_request(ctx, failed.then_some(failure));
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::metrics::names;

    fn quick() -> LoadSettings {
        LoadSettings {
            concurrency: 2,
            duration_secs: 5,
            error_pct: 50,
            queue_header_pct: 100,
        }
    }

    #[test]
    fn settings_are_validated() {
        assert!(LoadSettings::default().validate().is_ok());
        let zero = LoadSettings {
            concurrency: 0,
            ..LoadSettings::default()
        };
        assert!(zero.validate().is_err());
        let long = LoadSettings {
            duration_secs: 301,
            ..LoadSettings::default()
        };
        assert!(long.validate().is_err());
        let pct = LoadSettings {
            queue_header_pct: 101,
            ..LoadSettings::default()
        };
        assert!(pct.validate().is_err());
    }

    #[tokio::test]
    async fn only_one_load_runs_at_a_time() {
        let agent = Arc::new(Agent::new(AgentConfig::default()));
        let load = LoadController::new();

        let started: Vec<bool> = (0..4)
            .map(|_| load.try_start(agent.clone(), quick()))
            .collect();
        assert_eq!(started.iter().filter(|s| **s).count(), 1);
        assert!(load.is_running());

        assert!(load.stop().await);
        assert!(!load.is_running());
        assert!(!load.stop().await);
    }

    #[tokio::test]
    async fn stop_waits_for_workers() {
        let agent = Arc::new(Agent::new(AgentConfig::default()));
        let load = LoadController::new();
        assert!(load.try_start(agent.clone(), quick()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        load.stop().await;

        let status = load.status(&agent);
        assert!(!status.running);
        assert_eq!(status.in_flight, 0);
        assert!(status.requests_sent > 0);

        let dispatched = agent
            .store()
            .get_stats_no_scope(names::HTTP_DISPATCHER)
            .map(|s| s.call_count)
            .unwrap_or(0);
        assert_eq!(dispatched, status.requests_sent);
        assert!(agent.store().lookup_stats(names::QUEUE_TIME).is_some());
    }
}
