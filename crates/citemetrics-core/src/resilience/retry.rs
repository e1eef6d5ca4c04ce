//! Bounded retry loops: exponential backoff for transient transport errors
//! and hour-scale backoff for CAPTCHA walls.

use std::future::Future;
use std::time::Duration;

/// Retry policy for transient errors on idempotent calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before the attempt after `attempt` (0-based): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempts run out. The last error is returned unchanged.
pub async fn retry_transient<T, E, F, Fut>(
    policy: RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt + 1 < attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = attempts,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Backoff applied when a DOI redirect check hits a CAPTCHA wall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptchaBackoff {
    /// Retries after the first request.
    pub max_retries: u32,
    /// Sleep before retry `n` (1-based) is `unit * n`.
    pub unit: Duration,
}

impl Default for CaptchaBackoff {
    fn default() -> Self {
        Self {
            max_retries: 3,
            unit: Duration::from_secs(60 * 60),
        }
    }
}

impl CaptchaBackoff {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.unit.saturating_mul(retry)
    }
}

/// Result of one step of a CAPTCHA-guarded operation.
#[derive(Debug)]
pub enum Gated<T> {
    Ready(T),
    Captcha,
}

/// Call `op` until it returns [`Gated::Ready`], sleeping `unit * n` before
/// retry `n`. Returns `None` when every attempt hit the wall.
pub async fn with_captcha_backoff<T, E, F, Fut>(
    backoff: CaptchaBackoff,
    mut op: F,
) -> Result<Option<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Gated<T>, E>>,
{
    for retry in 0..=backoff.max_retries {
        if retry > 0 {
            let delay = backoff.delay_for(retry);
            tracing::warn!(
                retry,
                delay_secs = delay.as_secs(),
                "captcha detected, backing off"
            );
            tokio::time::sleep(delay).await;
        }
        if let Gated::Ready(value) = op(retry).await? {
            return Ok(Some(value));
        }
    }
    tracing::warn!(attempts = backoff.max_retries + 1, "captcha persisted, giving up");
    Ok(None)
}
