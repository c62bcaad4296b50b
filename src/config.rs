use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::sampler::{ParameterFilter, SamplePolicy, SamplerSettings};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ─── Agent configuration ─────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Apdex threshold T in seconds
    #[serde(default = "default_apdex_t")]
    pub apdex_t: f64,

    #[serde(default)]
    pub transaction_tracer: TransactionTracerConfig,

    /// Request parameter names whose values never leave the process
    #[serde(default = "default_sensitive_parameters")]
    pub sensitive_parameter_names: Vec<String>,

    /// Transactions that are not instrumented at all, e.g. `agent_test/entry_action`
    #[serde(default)]
    pub ignored_actions: HashSet<String>,

    /// Transactions that record metrics but no apdex
    #[serde(default)]
    pub apdex_ignored_actions: HashSet<String>,

    /// Record in-flight requests other than the current one as
    /// `Mongrel/Queue Length` when no depth header is sent
    #[serde(default)]
    pub worker_backlog: bool,

    /// Seconds between background harvests
    #[serde(default = "default_harvest_interval")]
    pub harvest_interval_secs: u64,

    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionTracerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds; when absent it is derived from apdex (4 × T)
    #[serde(default)]
    pub transaction_threshold: Option<f64>,

    #[serde(default)]
    pub policy: SamplePolicy,
}

fn default_apdex_t() -> f64 {
    0.5
}
fn default_sensitive_parameters() -> Vec<String> {
    vec!["password".into(), "social_security_number".into()]
}
fn default_harvest_interval() -> u64 {
    60
}
fn default_bind() -> String {
    "0.0.0.0:3000".into()
}
fn default_true() -> bool {
    true
}

impl Default for TransactionTracerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transaction_threshold: None,
            policy: SamplePolicy::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            apdex_t: default_apdex_t(),
            transaction_tracer: TransactionTracerConfig::default(),
            sensitive_parameter_names: default_sensitive_parameters(),
            ignored_actions: HashSet::new(),
            apdex_ignored_actions: HashSet::new(),
            worker_backlog: false,
            harvest_interval_secs: default_harvest_interval(),
            bind: default_bind(),
        }
    }
}

impl AgentConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject settings that would only misbehave later on the hot path.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.apdex_t.is_finite() || self.apdex_t < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "apdex_t must be a non-negative number, got {}",
                self.apdex_t
            )));
        }
        if let Some(t) = self.transaction_tracer.transaction_threshold {
            if !t.is_finite() || t < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "transaction_tracer.transaction_threshold must be non-negative, got {t}"
                )));
            }
        }
        if self.harvest_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "harvest_interval_secs must be at least 1".into(),
            ));
        }
        if self.sensitive_parameter_names.iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "sensitive_parameter_names must not contain empty names".into(),
            ));
        }
        Ok(())
    }

    /// Trace threshold in seconds, falling back to 4 × apdex T.
    pub fn transaction_threshold(&self) -> f64 {
        self.transaction_tracer
            .transaction_threshold
            .unwrap_or(4.0 * self.apdex_t)
    }

    pub fn is_ignored(&self, action: &str) -> bool {
        self.ignored_actions.contains(action)
    }

    pub fn is_apdex_ignored(&self, action: &str) -> bool {
        self.apdex_ignored_actions.contains(action)
    }

    pub fn sampler_settings(&self) -> SamplerSettings {
        SamplerSettings {
            enabled: self.transaction_tracer.enabled,
            threshold: self.transaction_threshold(),
            policy: self.transaction_tracer.policy,
            filter: ParameterFilter::new(&self.sensitive_parameter_names),
        }
    }
}
