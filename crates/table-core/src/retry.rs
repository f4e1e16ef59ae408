//! Bounded retry combinators.
//
// Every retry loop in the connection manager goes through here: soft reset,
// motion acknowledgement and the settings dump.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// How long to wait between attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay every time.
    Constant(Duration),
    /// Delay grows linearly: `step * attempt`.
    Linear(Duration),
    /// Delay doubles every attempt starting at `base`, capped at `max`.
    Exponential {
        /// First delay.
        base: Duration,
        /// Upper bound.
        max: Duration,
    },
}

impl Backoff {
    /// Delay to apply after failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant(d) => *d,
            Backoff::Linear(step) => step.saturating_mul(attempt + 1),
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt);
                base.saturating_mul(factor).min(*max)
            }
        }
    }
}

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use table_core::retry::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff: Backoff::Exponential {
///         base: Duration::from_secs(1),
///         max: Duration::from_secs(8),
///     },
/// };
/// assert_eq!(policy.backoff.delay(3), Duration::from_secs(8));
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `0` behaves like `1`.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// Three attempts, 100ms apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Constant(Duration::from_millis(100)),
        }
    }
}

/// Outcome of one attempt, as judged by the caller.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Done.
    Success(T),
    /// Worth trying again after the backoff.
    Retry(E),
    /// Give up immediately.
    Fatal(E),
}

/// Run `op` until it succeeds, fails fatally, or the policy is exhausted.
///
/// `op` receives the 0-based attempt number so it can scale per-attempt
/// timeouts. On exhaustion the last retryable error is returned.
pub async fn retry_with<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Attempt::Success(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Retry(err) => {
                if attempt + 1 >= attempts {
                    return Err(err);
                }
                let delay = policy.backoff.delay(attempt);
                debug!(attempt, ?delay, "Retrying after backoff");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Per-attempt timeout growing geometrically: `base * factor^attempt`.
pub fn geometric_timeout(base: Duration, factor: f64, attempt: u32) -> Duration {
    base.mul_f64(factor.powi(attempt as i32))
}
