//! Retry strategies for subscription delivery and transient backend faults
//!
//! A [`RetryStrategy`] is either `None` (a single attempt) or a bounded
//! backoff: fixed delay when the multiplier is 1.0, exponential otherwise,
//! capped at a maximum delay and optionally at a maximum number of attempts.
//! A retryability predicate can veto retries for specific errors.
//!
//! The strategy is consumed two ways: as an async [`RetryStrategy::execute`]
//! combinator, and as a [`RetryStrategy::delays`] iterator for callers that
//! drive the sleep themselves (the subscription workers, which must not
//! advance their position while retrying).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Predicate deciding whether an error is worth retrying
pub type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Retry behavior around a fallible operation
#[derive(Clone, Default)]
pub enum RetryStrategy {
    /// One attempt, no retries
    #[default]
    None,
    /// Delayed re-attempts with optional exponential growth
    Backoff(Backoff),
}

/// Backoff parameters
#[derive(Clone)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per retry; 1.0 gives a fixed delay
    pub multiplier: f64,
    /// Total attempts including the first; `None` retries indefinitely
    pub max_attempts: Option<u32>,
    /// Retryability veto; `None` retries every error
    pub should_retry: Option<RetryPredicate>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("max_attempts", &self.max_attempts)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl std::fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStrategy::None => write!(f, "None"),
            RetryStrategy::Backoff(b) => b.fmt(f),
        }
    }
}

impl RetryStrategy {
    /// No retries
    pub fn none() -> Self {
        RetryStrategy::None
    }

    /// Fixed delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        RetryStrategy::Backoff(Backoff {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_attempts: None,
            should_retry: None,
        })
    }

    /// Exponential backoff between `initial_delay` and `max_delay`
    pub fn exponential(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        RetryStrategy::Backoff(Backoff {
            initial_delay,
            max_delay,
            multiplier,
            max_attempts: None,
            should_retry: None,
        })
    }

    /// Bound the total number of attempts (including the first)
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        match self {
            RetryStrategy::None => RetryStrategy::None,
            RetryStrategy::Backoff(mut b) => {
                b.max_attempts = Some(max_attempts);
                RetryStrategy::Backoff(b)
            }
        }
    }

    /// Only retry errors accepted by the predicate
    pub fn with_retry_predicate<F>(self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        match self {
            RetryStrategy::None => RetryStrategy::None,
            RetryStrategy::Backoff(mut b) => {
                b.should_retry = Some(Arc::new(predicate));
                RetryStrategy::Backoff(b)
            }
        }
    }

    /// The sequence of delays between attempts
    ///
    /// Empty for [`RetryStrategy::None`]; otherwise yields
    /// `max_attempts - 1` delays (or indefinitely when unbounded).
    pub fn delays(&self) -> Delays {
        match self {
            RetryStrategy::None => Delays {
                next: Duration::ZERO,
                max: Duration::ZERO,
                multiplier: 1.0,
                remaining: Some(0),
            },
            RetryStrategy::Backoff(b) => Delays {
                next: b.initial_delay,
                max: b.max_delay,
                multiplier: b.multiplier,
                remaining: b.max_attempts.map(|n| n.saturating_sub(1)),
            },
        }
    }

    /// Whether the given error should be retried under this strategy
    pub fn retries(&self, error: &anyhow::Error) -> bool {
        match self {
            RetryStrategy::None => false,
            RetryStrategy::Backoff(b) => b.should_retry.as_ref().map_or(true, |p| p(error)),
        }
    }

    /// Run `operation` until it succeeds or the strategy is exhausted
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut delays = self.delays();
        let mut attempt: u32 = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !self.retries(&error) {
                        return Err(error);
                    }
                    match delays.next() {
                        Some(delay) => {
                            warn!(
                                "Attempt {} failed, retrying in {:?}: {}",
                                attempt, delay, error
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(error),
                    }
                }
            }
        }
    }
}

/// Iterator over the delays between attempts
#[derive(Debug, Clone)]
pub struct Delays {
    next: Duration,
    max: Duration,
    multiplier: f64,
    remaining: Option<u32>,
}

impl Iterator for Delays {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if let Some(remaining) = &mut self.remaining {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        let current = self.next.min(self.max);
        let grown = self.next.as_secs_f64() * self.multiplier;
        self.next = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));
        Some(current)
    }
}
