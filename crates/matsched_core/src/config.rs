//! Runtime settings.
//!
//! Defaults follow the scheduler design; every knob can be overridden
//! through an environment variable. Unparseable values fall back to the
//! default with a warning rather than aborting startup.

use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Substrate-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Per-GPU resident-model cache capacity.
    pub max_models_per_gpu: usize,

    /// Memory kept free on every device when gating allocations (MiB).
    pub memory_safety_margin_mb: u64,

    /// Scheduler poll interval.
    pub poll_interval: Duration,

    /// Expected worker heartbeat cadence.
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which a worker is considered offline.
    pub heartbeat_timeout: Duration,

    /// Webhook retries after the original attempt.
    pub webhook_max_retries: u32,

    /// Alert evaluation cadence.
    pub alert_check_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_models_per_gpu: 2,
            memory_safety_margin_mb: 2048,
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            webhook_max_retries: 3,
            alert_check_interval: Duration::from_secs(60),
        }
    }
}

impl Settings {
    /// Builds settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_models_per_gpu: env_or("MAX_MODELS_PER_GPU", defaults.max_models_per_gpu),
            memory_safety_margin_mb: env_or(
                "MEMORY_SAFETY_MARGIN_MB",
                defaults.memory_safety_margin_mb,
            ),
            poll_interval: Duration::from_millis(env_or(
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            heartbeat_interval: Duration::from_secs(env_or(
                "HEARTBEAT_INTERVAL_SECONDS",
                defaults.heartbeat_interval.as_secs(),
            )),
            heartbeat_timeout: Duration::from_secs(env_or(
                "HEARTBEAT_TIMEOUT_SECONDS",
                defaults.heartbeat_timeout.as_secs(),
            )),
            webhook_max_retries: env_or("WEBHOOK_MAX_RETRIES", defaults.webhook_max_retries),
            alert_check_interval: Duration::from_secs(env_or(
                "ALERT_CHECK_INTERVAL_SECONDS",
                defaults.alert_check_interval.as_secs(),
            )),
        }
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "unparseable environment override, using default");
                default
            }
        },
        Err(_) => default,
    }
}
