use std::sync::Arc;

use parking_lot::Mutex;

pub mod agent;
pub mod clock;
pub mod config;
pub mod handlers;
pub mod load_generator;
pub mod metrics;
pub mod middleware;
pub mod sampler;
pub mod server;

pub use agent::{Agent, HarvestCycle, HarvestSnapshot, RequestContext, RequestInfo};
pub use config::{AgentConfig, ConfigError};
pub use load_generator::LoadController;

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// The per-process agent. Middleware reports requests; endpoints read
    /// and harvest it.
    pub agent: Arc<Agent>,

    /// Shared by the background harvest task and `POST /api/harvest`, so each
    /// window's sample competes with the next one whichever path harvests.
    pub harvests: Mutex<HarvestCycle>,

    pub load: LoadController,
}

impl AppState {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self {
            agent,
            harvests: Mutex::new(HarvestCycle::new()),
            load: LoadController::new(),
        }
    }

    /// Close the current window through the shared harvest cycle.
    pub fn harvest(&self) -> HarvestSnapshot {
        self.harvests.lock().harvest(&self.agent)
    }
}
