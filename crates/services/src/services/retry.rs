use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::WebhookConfig;

/// Computes the delay before the next delivery attempt: exponential backoff
/// capped at the maximum delay, perturbed by bounded uniform jitter, never
/// negative. The random source is instance-confined behind a mutex, so a
/// scheduler can be shared across tasks.
#[derive(Clone)]
pub struct RetryScheduler {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: Duration,
    rng: Arc<Mutex<StdRng>>,
}

impl RetryScheduler {
    pub fn new(config: &WebhookConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic scheduler for tests.
    pub fn with_rng_seed(config: &WebhookConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &WebhookConfig, rng: StdRng) -> Self {
        Self {
            initial_delay: config.initial_retry_delay,
            max_delay: config.max_retry_delay,
            multiplier: config.retry_backoff_multiplier,
            jitter: config.retry_jitter,
            rng: Arc::new(Mutex::new(rng)),
        }
    }

    pub fn next_delay(&self, retry_count: i32) -> Duration {
        let initial = self.initial_delay.as_millis() as f64;
        let exponential = initial * self.multiplier.powi(retry_count.max(0));
        let capped = exponential.min(self.max_delay.as_millis() as f64) as i64;

        let jitter_range = self.jitter.as_millis() as i64;
        let jitter = if jitter_range == 0 {
            0
        } else {
            self.rng.lock().unwrap().gen_range(-jitter_range..=jitter_range)
        };

        Duration::from_millis(capped.saturating_add(jitter).max(0) as u64)
    }
}
