//! Token-bucket limiter shared by every worker of a pipeline run.
//!
//! The bucket starts full (`rate` tokens) and refills continuously at
//! `rate / period` tokens per second, never holding more than `rate`. A rate
//! below one still holds a single token, so one call per `period / rate`.
//! State lives only in memory: a fresh process starts with a full bucket.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::error::{PipelineError, Result};

#[derive(Debug)]
struct QuotaState {
    allowance: f64,
    last_check: Instant,
    consumed: u64,
    throttled: u64,
}

/// Cumulative limiter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaStats {
    /// Tokens handed out.
    pub consumed: u64,
    /// Calls that found the bucket empty (each blocking wait counts once).
    pub throttled: u64,
}

#[derive(Debug)]
pub struct QuotaController {
    rate: f64,
    period: Duration,
    /// Bucket size: `rate`, but never below one whole token.
    capacity: f64,
    state: Mutex<QuotaState>,
}

impl QuotaController {
    /// Allows `rate` calls per `period`.
    pub fn new(rate: f64, period: Duration) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(PipelineError::config(format!(
                "quota rate must be positive, got {rate}"
            )));
        }
        if period.is_zero() {
            return Err(PipelineError::config("quota period must be non-zero"));
        }
        let capacity = rate.max(1.0);
        Ok(Self {
            rate,
            period,
            capacity,
            state: Mutex::new(QuotaState {
                allowance: capacity,
                last_check: Instant::now(),
                consumed: 0,
                throttled: 0,
            }),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn per_second(&self) -> f64 {
        self.rate / self.period.as_secs_f64()
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refills the bucket and takes one token if available.
    ///
    /// Returns `Ok(())` on success, or the time until the next token otherwise.
    fn take(&self) -> std::result::Result<(), Duration> {
        let mut state = self.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_check).as_secs_f64();
        state.last_check = now;
        state.allowance = (state.allowance + elapsed * self.per_second()).min(self.capacity);

        if state.allowance >= 1.0 {
            state.allowance -= 1.0;
            state.consumed += 1;
            Ok(())
        } else {
            let missing = 1.0 - state.allowance;
            Err(Duration::from_secs_f64(missing / self.per_second()))
        }
    }

    fn record_throttle(&self) {
        self.lock().throttled += 1;
    }

    /// Takes one token.
    ///
    /// With `wait == false` an empty bucket returns `false` immediately. With
    /// `wait == true` the caller sleeps until a token accrues and the call
    /// always returns `true`.
    pub async fn try_consume(&self, wait: bool) -> bool {
        let mut throttled = false;
        loop {
            match self.take() {
                Ok(()) => return true,
                Err(shortfall) => {
                    if !throttled {
                        self.record_throttle();
                        throttled = true;
                    }
                    if !wait {
                        return false;
                    }
                    debug!(wait_ms = shortfall.as_millis() as u64, "quota exhausted, waiting");
                    // Another worker may take the token first; loop and re-check.
                    sleep(shortfall.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Blocks until a token is available and takes it.
    pub async fn acquire(&self) {
        self.try_consume(true).await;
    }

    pub fn stats(&self) -> QuotaStats {
        let state = self.lock();
        QuotaStats {
            consumed: state.consumed,
            throttled: state.throttled,
        }
    }

    /// Tokens currently available, after refilling.
    pub fn available(&self) -> f64 {
        let mut state = self.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_check).as_secs_f64();
        state.last_check = now;
        state.allowance = (state.allowance + elapsed * self.per_second()).min(self.capacity);
        state.allowance
    }
}
