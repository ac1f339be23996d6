use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Largest relative perturbation applied to a backoff delay.
pub const JITTER_FRACTION: f64 = 0.2;

/// Immutable retry configuration for one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Backoff before the attempt following `attempt` (1-based), without jitter.
    ///
    /// delay = min(base_delay * backoff_factor^(attempt - 1), max_delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    /// Backoff for `attempt` with jitter applied when enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter {
            let offset = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
            apply_jitter(delay, offset)
        } else {
            delay
        }
    }
}

/// Scales `delay` by `1 + offset`, where `offset` is clamped to ±[`JITTER_FRACTION`].
pub fn apply_jitter(delay: Duration, offset: f64) -> Duration {
    let offset = offset.clamp(-JITTER_FRACTION, JITTER_FRACTION);
    delay.mul_f64(1.0 + offset)
}
