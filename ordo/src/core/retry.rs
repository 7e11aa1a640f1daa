//! Retry policies and the [`Retryable`] classification trait.
//!
//! Two things decide whether a failed operation runs again:
//!
//! 1. A [`RetryPolicy`] controls HOW MANY attempts are made and WHEN (the
//!    exponential backoff schedule). `None` means a single attempt.
//! 2. The [`Retryable`] trait controls WHICH errors are worth another attempt.
//!    A timeout usually is, a validation failure usually is not.
//!
//! [`retry_with_policy`] combines both. Activities use it inside the executor
//! so a flow only ever records the final outcome of an activity, and the
//! worker uses the same policy type to back off infrastructure failures.

use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "RawRetryPolicy")]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first try).
    ///
    /// For example, `max_attempts = 3` means:
    /// - Attempt 1: immediate (first try)
    /// - Attempt 2: after initial_delay
    /// - Attempt 3: after initial_delay * backoff_multiplier
    pub max_attempts: u32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (caps exponential backoff).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff.
    ///
    /// Each retry delay is calculated as:
    /// `min(initial_delay * backoff_multiplier^(attempt-1), max_delay)`
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// No retries - fail immediately on first error.
    pub const NONE: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::from_secs(0),
        max_delay: Duration::from_secs(0),
        backoff_multiplier: 1.0,
    };

    /// Standard retry policy: 3 attempts, 1s initial delay, 30s cap, 2x backoff.
    ///
    /// Retry schedule: immediate → 1s → 2s
    pub const STANDARD: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
    };

    /// Aggressive retry policy: 10 attempts starting at 100ms, 1.5x backoff,
    /// capped at 10 seconds.
    pub const AGGRESSIVE: Self = Self {
        max_attempts: 10,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 1.5,
    };

    /// Create a policy with custom max_attempts (uses standard delays).
    pub const fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Same policy with a different initial delay.
    pub const fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Calculate the delay before the next retry attempt.
    ///
    /// `attempt` is the attempt that just failed (1-indexed). Returns `None`
    /// once `max_attempts` is reached. A delay that cannot be represented
    /// falls back to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let exponent = attempt.saturating_sub(1) as f64;
        let multiplier = self.backoff_multiplier.powf(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        Some(
            Duration::try_from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
                .unwrap_or(self.max_delay),
        )
    }
}

/// Wire form of [`RetryPolicy`], checked before it becomes one.
#[derive(serde::Deserialize)]
struct RawRetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = String;

    fn try_from(raw: RawRetryPolicy) -> Result<Self, Self::Error> {
        if !raw.backoff_multiplier.is_finite() || raw.backoff_multiplier <= 0.0 {
            return Err(format!(
                "backoff_multiplier must be a positive number, got {}",
                raw.backoff_multiplier
            ));
        }
        Ok(Self {
            max_attempts: raw.max_attempts,
            initial_delay: raw.initial_delay,
            max_delay: raw.max_delay,
            backoff_multiplier: raw.backoff_multiplier,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u32> for RetryPolicy {
    fn from(max_attempts: u32) -> Self {
        Self::with_max_attempts(max_attempts)
    }
}

/// Trait for error types to specify whether they should trigger a retry.
///
/// # Example
///
/// ```rust
/// use ordo::core::Retryable;
///
/// #[derive(Debug)]
/// enum KitchenError {
///     Busy,
///     OutOfStock,
/// }
///
/// impl Retryable for KitchenError {
///     fn is_retryable(&self) -> bool {
///         matches!(self, KitchenError::Busy)
///     }
/// }
/// ```
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Executes a fallible operation with retry logic.
///
/// The operation receives the current attempt number (1-indexed). An error is
/// retried only when it is [`Retryable`] and the policy has attempts left;
/// otherwise it is returned as is.
///
/// ```ignore
/// let result = retry_with_policy(Some(RetryPolicy::STANDARD), |attempt| async move {
///     call_kitchen(attempt).await
/// })
/// .await;
/// ```
pub async fn retry_with_policy<F, Fut, T, E>(
    retry_policy: Option<RetryPolicy>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Debug,
{
    let Some(policy) = retry_policy else {
        return operation(1).await;
    };

    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.is_retryable() {
                    tracing::debug!("Operation failed with non-retryable error: {:?}", error);
                    return Err(error);
                }

                match policy.delay_for_attempt(attempt) {
                    Some(delay) => {
                        tracing::debug!(
                            "Retryable failure (attempt {}/{}): {:?}. Retrying after {:?}",
                            attempt,
                            policy.max_attempts,
                            error,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        tracing::warn!(
                            "Operation failed and exhausted retry attempts ({}/{}): {:?}",
                            attempt,
                            policy.max_attempts,
                            error
                        );
                        return Err(error);
                    }
                }
            }
        }
    }
}
