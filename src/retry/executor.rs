use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::classifier::{ErrorClass, classify};
use super::policy::RetryPolicy;
use crate::stage::StageResult;

/// Which failures the executor is allowed to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Classifier-driven: transient failures are retried, permanent ones fail
    /// fast, unknown ones are retried only when `retry_unknown` is set.
    Smart { retry_unknown: bool },
    /// Every failure is retried until attempts run out.
    Blind,
}

impl Default for RetryMode {
    fn default() -> Self {
        RetryMode::Smart {
            retry_unknown: false,
        }
    }
}

/// Terminal result of running a unit of work under a retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub result: StageResult,
    /// Attempts counted against the policy, including any carried over from
    /// an interrupted run.
    pub attempts: u32,
    /// Classification of the last failure; `None` on success.
    pub class: Option<ErrorClass>,
}

impl RetryOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs one unit of work with bounded retries and exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    mode: RetryMode,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            mode: RetryMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: RetryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn mode(&self) -> RetryMode {
        self.mode
    }

    /// Runs `work` until it succeeds or the policy gives up.
    ///
    /// `work` receives the 1-based attempt number.
    pub async fn run<F, Fut>(&self, work: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = StageResult>,
    {
        self.run_from(0, work).await
    }

    /// Like [`run`](Self::run), but counts `prior_attempts` already spent on
    /// this unit of work against `max_attempts`. At least one attempt is
    /// always made.
    pub async fn run_from<F, Fut>(&self, prior_attempts: u32, mut work: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = StageResult>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = prior_attempts.min(max_attempts - 1);

        loop {
            attempt += 1;
            let failure = match work(attempt).await {
                Ok(output) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(output),
                        attempts: attempt,
                        class: None,
                    };
                }
                Err(failure) => failure,
            };

            let class = classify(&failure);
            let retryable = self.is_retryable(class);

            if !retryable || attempt >= max_attempts {
                match (class, retryable) {
                    (ErrorClass::Unknown, false) => warn!(
                        attempt,
                        class = %class,
                        error = %failure,
                        "unclassified failure, not retrying"
                    ),
                    (_, false) => debug!(attempt, class = %class, error = %failure, "failing fast"),
                    (_, true) => warn!(
                        attempt,
                        max_attempts,
                        class = %class,
                        error = %failure,
                        "retry attempts exhausted"
                    ),
                }
                return RetryOutcome {
                    result: Err(failure),
                    attempts: attempt,
                    class: Some(class),
                };
            }

            let delay = self.delay_after(attempt, failure.retry_after);
            warn!(
                attempt,
                max_attempts,
                class = %class,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying"
            );
            sleep(delay).await;
        }
    }

    fn is_retryable(&self, class: ErrorClass) -> bool {
        match self.mode {
            RetryMode::Blind => true,
            RetryMode::Smart { retry_unknown } => match class {
                ErrorClass::Transient => true,
                ErrorClass::Permanent => false,
                ErrorClass::Unknown => retry_unknown,
            },
        }
    }

    fn delay_after(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let backoff = self.policy.backoff(attempt);
        match hint {
            Some(after) if after > backoff => after.min(self.policy.max_delay),
            _ => backoff,
        }
    }
}
