use std::sync::Arc;
use std::time::Duration;

use apm_agent::handlers::agent_test;
use apm_agent::{server, Agent, AgentConfig, AppState};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Path of the JSON config file; defaults apply when unset.
const CONFIG_ENV: &str = "APM_AGENT_CONFIG";
/// Overrides `bind` from the config file.
const BIND_ENV: &str = "APM_AGENT_BIND";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // ── 1. Load configuration ───────────────────────────────────
    let mut config = match std::env::var(CONFIG_ENV) {
        Ok(path) => match AgentConfig::from_file(&path) {
            Ok(config) => {
                info!(%path, "loaded agent config");
                config
            }
            Err(e) => {
                error!(%path, "{e}");
                std::process::exit(1);
            }
        },
        Err(_) => {
            warn!("{CONFIG_ENV} not set, using default agent config");
            AgentConfig::default()
        }
    };
    if let Ok(bind) = std::env::var(BIND_ENV) {
        config.bind = bind;
    }
    agent_test::register_exclusions(&mut config);

    // ── 2. Build shared state ───────────────────────────────────
    let bind = config.bind.clone();
    let interval = Duration::from_secs(config.harvest_interval_secs);
    let agent = Arc::new(Agent::new(config));
    let state = Arc::new(AppState::new(agent));

    // ── 3. Periodic harvest ─────────────────────────────────────
    let harvester = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = harvester.harvest();
            info!(
                requests = snapshot.response_time.count,
                p95_us = snapshot.response_time.p95,
                sample = snapshot.samples.first().map(|s| s.transaction_name.as_str()),
                "harvest cycle complete"
            );
        }
    });

    // ── 4. Bind & serve ─────────────────────────────────────────
    let app = server::create_router(state);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%bind, "failed to bind: {e}");
            std::process::exit(1);
        }
    };

    info!("listening on http://{bind}");
    info!("metrics JSON → http://{bind}/api/metrics");
    info!("metrics SSE  → http://{bind}/api/metrics/stream");

    if let Err(e) = axum::serve(listener, app).await {
        error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
