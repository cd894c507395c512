//! Retry policy with exponential backoff and jitter.
//!
//! The backoff math is a pure function of the attempt number (and, for
//! jitter, a caller-supplied unit sample) so every schedule is testable
//! without sleeping. [`retry_with_policy`] is the plain higher-order
//! wrapper around it: run an operation, sleep the computed delay between
//! failed attempts, and return the last error once attempts run out.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Base backoff delay in milliseconds for retry attempts.
pub const RETRY_BACKOFF_BASE_MS: u64 = 2000;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Multiplier for exponential backoff.
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Jitter fraction applied around each delay (±25%).
pub const JITTER_FRACTION: f64 = 0.25;

/// Retry schedule parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    /// Exponential multiplier between attempts.
    pub multiplier: u64,
    /// Jitter fraction in `[0, 1)` applied symmetrically around the base.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(RETRY_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
            multiplier: BACKOFF_MULTIPLIER,
            jitter: JITTER_FRACTION,
        }
    }
}

impl RetryPolicy {
    /// Policy with no jitter, for deterministic schedules.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Set the attempt budget.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Exponential backoff delay for a given attempt number (1-indexed),
    /// capped at `max_delay`. No jitter.
    ///
    /// # Example
    ///
    /// ```
    /// use relay::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff_delay(1), Duration::from_millis(2000));
    /// assert_eq!(policy.backoff_delay(2), Duration::from_millis(4000));
    /// assert_eq!(policy.backoff_delay(3), Duration::from_millis(8000));
    /// ```
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.multiplier.saturating_pow(exponent);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let delay = base_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(max_ms))
    }

    /// Backoff delay with jitter, as a pure function of the attempt and a
    /// unit sample in `[0, 1)`.
    ///
    /// The sample spreads the delay over `base ± jitter * base`: 0.0 maps
    /// to the lower bound, 0.5 to the base, just-under-1.0 to the upper
    /// bound. The result is still capped at `max_delay`.
    #[must_use]
    pub fn backoff_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.backoff_delay(attempt).as_secs_f64();
        let spread = 2.0 * unit.clamp(0.0, 1.0) - 1.0;
        let jittered = base * (1.0 + self.jitter * spread);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    /// Backoff delay with a random jitter sample.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if self.jitter == 0.0 {
            return self.backoff_delay(attempt);
        }
        self.backoff_with_jitter(attempt, fastrand::f64())
    }
}

/// Run `operation` up to `policy.max_attempts` times, sleeping the
/// policy's delay between failed attempts.
///
/// Returns the first success, or the last error once the budget is
/// spent. The operation is a plain async closure; no trait to implement.
///
/// # Example
///
/// ```
/// use relay::retry::{retry_with_policy, RetryPolicy};
/// use std::time::Duration;
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let policy = RetryPolicy::default()
///     .with_max_attempts(3)
///     .with_base_delay(Duration::from_millis(1));
/// let result = retry_with_policy(&policy, || async { Ok::<_, anyhow::Error>(42) }).await;
/// assert_eq!(result.unwrap(), 42);
/// # });
/// ```
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(attempt, max = policy.max_attempts, "operation failed: {e:#}");
                last_error = Some(e);
            }
        }

        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.next_delay(attempt)).await;
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("retry budget was zero")))
}
