//! Environment-driven runtime settings

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::{RetryPolicy, RetrySchedule};
use crate::workflow::Step;

/// Transport/persistence selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    SingleProcess,
    Distributed,
}

impl RuntimeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleProcess => "single_process",
            Self::Distributed => "distributed",
        }
    }
}

/// Application-wide settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: RuntimeMode,
    /// Connection string for the distributed event store; ignored in
    /// single-process mode.
    pub event_store_url: Option<String>,
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub app_env: String,
    pub global_concurrency: usize,
    pub tenant_concurrency: usize,
    /// Per-run model spend cap in USD; zero disables the cap.
    pub run_model_budget: f64,
    pub cache_retrieval: bool,
    pub cache_tool_results: bool,
    pub clear_data_on_startup: bool,
    pub guardrail_input_enabled: bool,
    pub guardrail_context_sanitizer_enabled: bool,
    pub guardrail_output_validator_enabled: bool,
    pub github_token: Option<String>,
    pub retries: RetrySchedule,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::SingleProcess,
            event_store_url: None,
            data_dir: PathBuf::from("data"),
            bind_addr: "0.0.0.0:8000".to_string(),
            app_env: "development".to_string(),
            global_concurrency: 8,
            tenant_concurrency: 4,
            run_model_budget: 0.0,
            cache_retrieval: true,
            cache_tool_results: true,
            clear_data_on_startup: false,
            guardrail_input_enabled: true,
            guardrail_context_sanitizer_enabled: true,
            guardrail_output_validator_enabled: true,
            github_token: None,
            retries: RetrySchedule::default(),
        }
    }
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mode = match env_str("RUNWAY_MODE").or_else(|| env_str("MODE")).as_deref() {
            Some("distributed") => RuntimeMode::Distributed,
            _ => RuntimeMode::SingleProcess,
        };

        let mut retries = RetrySchedule::default();
        for step in Step::ALL {
            let upper = step.as_str().to_uppercase();
            let base = retries.policy_for(step);
            let max_attempts = env_u32(&format!("MAX_ATTEMPTS_{upper}"))
                .unwrap_or(base.max_attempts)
                .max(1);
            let backoff_base = env_u64(&format!("BACKOFF_BASE_{upper}"))
                .map(Duration::from_secs)
                .unwrap_or(base.backoff_base);
            retries.set(step, RetryPolicy::new(max_attempts, backoff_base));
        }

        Self {
            mode,
            event_store_url: env_str("EVENT_STORE_URL"),
            data_dir: env_str("RUNWAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            bind_addr: env_str("BIND_ADDR").unwrap_or(defaults.bind_addr),
            app_env: env_str("APP_ENV").unwrap_or(defaults.app_env),
            global_concurrency: env_usize("GLOBAL_CONCURRENCY")
                .unwrap_or(defaults.global_concurrency),
            tenant_concurrency: env_usize("TENANT_CONCURRENCY")
                .unwrap_or(defaults.tenant_concurrency),
            run_model_budget: env_f64("RUN_MODEL_BUDGET")
                .unwrap_or(defaults.run_model_budget)
                .max(0.0),
            cache_retrieval: env_bool("CACHE_RETRIEVAL").unwrap_or(defaults.cache_retrieval),
            cache_tool_results: env_bool("CACHE_TOOL_RESULTS")
                .unwrap_or(defaults.cache_tool_results),
            clear_data_on_startup: env_bool("CLEAR_DATA_ON_STARTUP")
                .unwrap_or(defaults.clear_data_on_startup),
            guardrail_input_enabled: env_bool("GUARDRAIL_INPUT_ENABLED")
                .unwrap_or(defaults.guardrail_input_enabled),
            guardrail_context_sanitizer_enabled: env_bool("GUARDRAIL_CONTEXT_SANITIZER_ENABLED")
                .unwrap_or(defaults.guardrail_context_sanitizer_enabled),
            guardrail_output_validator_enabled: env_bool("GUARDRAIL_OUTPUT_VALIDATION_ENABLED")
                .unwrap_or(defaults.guardrail_output_validator_enabled),
            github_token: env_str("GITHUB_TOKEN"),
            retries,
        }
    }
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_str(name).map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_usize(name: &str) -> Option<usize> {
    env_str(name).and_then(|v| v.trim().parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    env_str(name).and_then(|v| v.trim().parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env_str(name).and_then(|v| v.trim().parse().ok())
}

fn env_f64(name: &str) -> Option<f64> {
    env_str(name).and_then(|v| v.trim().parse().ok())
}
