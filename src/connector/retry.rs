use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::DeliveryConfig;

/// Largest jitter, as a fraction of the computed delay.
pub const MAX_JITTER_RATIO: f64 = 0.2;

/// Exponential backoff: `min(base * 2^(attempt-1), max)` plus optional jitter
/// of up to 20% of that delay.
#[derive(Debug)]
pub struct RetryPolicy {
    max_retry_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    use_jitter: bool,
    rng: Mutex<StdRng>,
}

impl RetryPolicy {
    pub fn new(max_retry_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retry_attempts,
            base_delay,
            max_delay,
            use_jitter: false,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    /// Fix the jitter source so delays are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        let policy = Self::new(
            config.max_retry_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.use_jitter);
        match config.jitter_seed {
            Some(seed) => policy.with_seed(seed),
            None => policy,
        }
    }

    /// First attempt plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retry_attempts.saturating_add(1)
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based),
    /// without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`backoff`](Self::backoff) plus jitter when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if !self.use_jitter || delay.is_zero() {
            return delay;
        }
        let ratio = match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..=MAX_JITTER_RATIO),
            Err(poisoned) => poisoned.into_inner().gen_range(0.0..=MAX_JITTER_RATIO),
        };
        delay + delay.mul_f64(ratio)
    }
}

/// Status codes worth retrying: 5xx, 408 and 429.
pub fn is_retryable_status(status: u16) -> bool {
    (500..=599).contains(&status) || status == 408 || status == 429
}
