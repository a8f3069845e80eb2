//! Engine configuration, loaded from the environment.

use std::env;

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Size of the worker pool executing processes.
    pub max_workers: usize,

    /// Run processes inline on the caller instead of dispatching to the
    /// pool. Test/synchronous mode only.
    pub testing: bool,

    /// Completed tasks older than this many days are deleted by the
    /// cleanup task.
    pub task_log_retention_days: i64,

    /// Advisory flag for the domain-model collaborator.
    pub cache_domain_models: bool,

    /// Whether a successful attempt resets the retry counter kept on
    /// deduplicated failure rows. Matches observed behavior when true.
    pub reset_retries_after_success: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            testing: false,
            task_log_retention_days: 30,
            cache_domain_models: true,
            reset_retries_after_success: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `SUBFLOW_*` environment variables,
    /// falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_workers: env_parse("SUBFLOW_MAX_WORKERS", defaults.max_workers),
            testing: env_parse("SUBFLOW_TESTING", defaults.testing),
            task_log_retention_days: env_parse(
                "SUBFLOW_TASK_LOG_RETENTION_DAYS",
                defaults.task_log_retention_days,
            ),
            cache_domain_models: env_parse(
                "SUBFLOW_CACHE_DOMAIN_MODELS",
                defaults.cache_domain_models,
            ),
            reset_retries_after_success: env_parse(
                "SUBFLOW_RESET_RETRIES_AFTER_SUCCESS",
                defaults.reset_retries_after_success,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
