//! Rate-limit aware retrying of requests

use std::{fmt, future::Future, ops::Range, time::Duration};

use rand::Rng;

use crate::{Classify, ErrorClassification};

const DEFAULT_RETRY_AFTER_SECS: u64 = 3;

/// Configuration for how failed requests are retried
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    max_retries: u32,
    max_accumulated_delay: Duration,
}

impl Default for RetryConfig {
    /// Default retry configuration
    ///
    /// Retries up to 3 times, giving up once the delays would add up to 3
    /// minutes.
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_accumulated_delay: Duration::from_secs(180),
        }
    }
}

impl RetryConfig {
    /// Constructs a new retry configuration
    ///
    /// A request is attempted at most `max_retries + 1` times. Before every
    /// retry the delay is added to a running total, and retrying stops once
    /// that total reaches `max_accumulated_delay`.
    pub fn new(max_retries: u32, max_accumulated_delay: Duration) -> Self {
        Self {
            max_retries,
            max_accumulated_delay,
        }
    }

    /// Sets the maximum number of retries
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the budget for the sum of all delays
    #[must_use]
    pub fn with_max_accumulated_delay(mut self, max_accumulated_delay: Duration) -> Self {
        self.max_accumulated_delay = max_accumulated_delay;
        self
    }

    /// The maximum number of retries
    #[inline]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The budget for the sum of all delays
    #[inline]
    pub fn max_accumulated_delay(&self) -> Duration {
        self.max_accumulated_delay
    }
}

/// A type that provides some jittering of delays
pub trait JitterSource: fmt::Debug + Send + Sync {
    /// Picks a duration from `range`
    fn jitter(&self, range: Range<Duration>) -> Duration;
}

/// A jitter source that always picks the low end of the range
#[derive(Clone, Copy, Debug, Default)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&self, range: Range<Duration>) -> Duration {
        range.start
    }
}

/// Picks a delay uniformly from the range
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, range: Range<Duration>) -> Duration {
        if range.is_empty() {
            range.start
        } else {
            rand::thread_rng().gen_range(range)
        }
    }
}

/// Retry bookkeeping for one logical request, including all of its retries
#[derive(Clone, Debug)]
pub struct RetryContext {
    max_retries: u32,
    attempts_remaining: u32,
    accumulated_delay: Duration,
    max_delay_budget: Duration,
}

impl RetryContext {
    /// Starts tracking a new request
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            attempts_remaining: config.max_retries,
            accumulated_delay: Duration::ZERO,
            max_delay_budget: config.max_accumulated_delay,
        }
    }

    /// Retries still available
    #[inline]
    pub fn attempts_remaining(&self) -> u32 {
        self.attempts_remaining
    }

    /// The sum of all delays handed out so far
    #[inline]
    pub fn accumulated_delay(&self) -> Duration {
        self.accumulated_delay
    }

    /// Decides whether to retry after a failure, and how long to wait first
    ///
    /// Rate limits wait for one second more than the provider asked (3 s when
    /// it did not say). The first retry adds no jitter, the last adds 1–5 s,
    /// and any in between add 5–10 s. Transient server errors wait 1–2 s.
    /// Returns `None` if the failure is not retryable, no retries remain, or
    /// the delay would exhaust the budget.
    pub fn next_delay(
        &mut self,
        classification: &ErrorClassification,
        jitter: &dyn JitterSource,
    ) -> Option<Duration> {
        if self.attempts_remaining == 0 {
            return None;
        }

        let delay = match classification {
            ErrorClassification::RateLimited { retry_after } => {
                let base = Duration::from_secs(
                    retry_after
                        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                        .saturating_add(1),
                );

                let extra = if self.attempts_remaining >= self.max_retries {
                    Duration::ZERO
                } else if self.attempts_remaining == 1 {
                    jitter.jitter(Duration::from_secs(1)..Duration::from_secs(5))
                } else {
                    jitter.jitter(Duration::from_secs(5)..Duration::from_secs(10))
                };

                base.saturating_add(extra)
            }
            ErrorClassification::TransientServer { .. } => {
                jitter.jitter(Duration::from_secs(1)..Duration::from_secs(2))
            }
            _ => return None,
        };

        self.accumulated_delay = self.accumulated_delay.saturating_add(delay);
        if self.accumulated_delay >= self.max_delay_budget {
            tracing::debug!(
                accumulated_delay = ?self.accumulated_delay,
                max_delay_budget = ?self.max_delay_budget,
                "retry delay budget exhausted"
            );
            return None;
        }

        self.attempts_remaining -= 1;
        Some(delay)
    }
}

/// Runs an operation, retrying it when its failures classify as retryable
#[derive(Clone, Debug, Default)]
pub struct RetryingExecutor<J = RandomJitter> {
    config: RetryConfig,
    jitter: J,
}

impl RetryingExecutor {
    /// Constructs a new executor with random jitter
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            jitter: RandomJitter,
        }
    }
}

impl<J: JitterSource> RetryingExecutor<J> {
    /// Replaces the jitter source
    pub fn with_jitter<K: JitterSource>(self, jitter: K) -> RetryingExecutor<K> {
        RetryingExecutor {
            config: self.config,
            jitter,
        }
    }

    /// The retry configuration
    #[inline]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `op` until it succeeds, fails in a way that is not retryable, or
    /// runs out of retries
    ///
    /// The error from the last attempt is returned.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let mut ctx = RetryContext::new(&self.config);

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let classification = err.classify();
            match ctx.next_delay(&classification, &self.jitter) {
                Some(delay) => {
                    tracing::warn!(
                        error = %err,
                        ?delay,
                        attempts_remaining = ctx.attempts_remaining(),
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    if classification.is_retryable() {
                        tracing::warn!(error = %err, "request failed, giving up");
                    }
                    return Err(err);
                }
            }
        }
    }
}
