//! Retry with exponential backoff.
//!
//! Used for bringing a provider up, where the store may still be starting.
//! Bus submissions are never retried: a timed-out mutation may already have
//! been applied.
//!
//! # Example
//!
//! ```rust
//! use querybus_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(5))
//!     .build();
//!
//! let version = retry_with_backoff(policy, || async { Ok::<_, String>("8.0.36") }).await?;
//! assert_eq!(version, "8.0.36");
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Exponential backoff settings.
///
/// Defaults: 3 retries, 100ms initial delay, 30s cap, doubling.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Start building a policy from the defaults.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: RetryPolicy {
                max_retries: DEFAULT_MAX_RETRIES,
                initial_delay: DEFAULT_INITIAL_DELAY,
                max_delay: DEFAULT_MAX_DELAY,
                multiplier: DEFAULT_MULTIPLIER,
            },
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::builder().max_retries(0).build()
    }

    /// Delay before retry number `attempt` (zero-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        if !factor.is_finite() || factor < 0.0 {
            return self.max_delay;
        }
        // Precision loss is irrelevant at backoff granularity.
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let delay_nanos = (self.initial_delay.as_nanos() as f64 * factor) as u128;
        if delay_nanos >= self.max_delay.as_nanos() {
            self.max_delay
        } else {
            Duration::from_nanos(u64::try_from(delay_nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set the number of retries after the first attempt.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set the cap on any single delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Retry `operation` on every error until it succeeds or retries run out.
///
/// # Errors
///
/// Returns the last error once `policy.max_retries` retries have failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry `operation` while `is_retryable` accepts the error.
///
/// # Errors
///
/// Returns the first error `is_retryable` rejects, or the last error once
/// retries run out.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            tracing::warn!(error = %err, "Error is not retryable, failing immediately");
            return Err(err);
        }
        if attempt >= policy.max_retries {
            tracing::error!(attempt, error = %err, "Operation failed after max retries");
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        tracing::warn!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Operation failed, retrying"
        );
        sleep(delay).await;
        attempt += 1;
    }
}
