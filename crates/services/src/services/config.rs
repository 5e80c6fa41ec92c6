use std::time::Duration;

const MAX_RETRIES_ENV: &str = "WEBHOOK_MAX_RETRIES";
const RETENTION_DAYS_ENV: &str = "WEBHOOK_RETENTION_DAYS";

/// Tunables for the webhook reliability engine.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Retry budget fixed on each event at admission time.
    pub max_retries: i32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_backoff_multiplier: f64,
    /// Uniform jitter applied on top of the capped exponential delay.
    pub retry_jitter: Duration,
    /// Batch size for administrative reinstatement of failed events.
    pub default_retry_limit: u64,
    /// Terminal events older than this are soft-deleted.
    pub retention_days: i64,
    /// Soft-deleted events older than this are purged for good.
    pub purge_after_days: i64,
    /// Events stuck in processing longer than this are requeued at startup.
    pub stale_processing_after: Duration,
    pub sweep_interval: Duration,
    pub purge_interval: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_retry_delay: Duration::from_millis(1000),
            max_retry_delay: Duration::from_millis(60_000),
            retry_backoff_multiplier: 2.0,
            retry_jitter: Duration::from_millis(500),
            default_retry_limit: 50,
            retention_days: 30,
            purge_after_days: 7,
            stale_processing_after: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            purge_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl WebhookConfig {
    /// Defaults with environment overrides applied. Unparseable values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_i32(MAX_RETRIES_ENV) {
            config.max_retries = value.max(0);
        }
        if let Some(value) = env_i64(RETENTION_DAYS_ENV) {
            config.retention_days = value.max(1);
        }
        config
    }
}

fn env_i32(name: &str) -> Option<i32> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, raw = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn env_i64(name: &str) -> Option<i64> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(name, raw = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
