//! Retry with capped exponential backoff, shared by segment fetches and
//! license requests.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::TransportError;

/// How often and how patiently a transfer is re-attempted.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay, jitter included.
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exactly one retry after a short pause. Used for license exchanges.
    pub fn once() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter: false,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub(crate) fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Shifts past 31 saturate instead of overflowing.
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let backoff = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return backoff;
        }

        let half_base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let headroom_ms =
            u64::try_from(self.max_delay.saturating_sub(backoff).as_millis()).unwrap_or(0);
        let limit_ms = half_base_ms.min(headroom_ms);
        if limit_ms == 0 {
            return backoff;
        }

        let jitter = Duration::from_millis(rand::rng().random_range(0..limit_ms));
        (backoff + jitter).min(self.max_delay)
    }
}

/// Outcome of one attempt as judged by the caller.
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure; try again if the policy allows.
    Retry(TransportError),
    /// Permanent failure; give up now.
    Fail(TransportError),
}

/// Runs `operation` until it succeeds, fails permanently, runs out of
/// retries, or `token` is cancelled.
///
/// The closure receives the zero-based attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, TransportError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => err,
        };

        let delay = policy.delay_for_attempt(attempt);
        attempt += 1;
        warn!(
            attempt,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient transfer error, retrying"
        );

        tokio::select! {
            _ = token.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Connection, timeout and body errors are worth another attempt; redirect
/// loops and builder errors are not.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    fn unavailable() -> TransportError {
        TransportError::http_status(StatusCode::SERVICE_UNAVAILABLE, "http://cdn/seg")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_under_cap() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(120),
            jitter: true,
        };
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast(3), &CancellationToken::new(), |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Fail(TransportError::http_status(StatusCode::NOT_FOUND, "http://cdn/x"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transient_failure_exhausts_retries() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast(2), &CancellationToken::new(), |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(unavailable()) }
        })
        .await;
        assert!(matches!(result, Err(TransportError::HttpStatus { .. })));
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn recovers_on_later_attempt() {
        let result = retry_with_backoff(&fast(3), &CancellationToken::new(), |attempt| async move {
            if attempt < 2 {
                RetryAction::Retry(unavailable())
            } else {
                RetryAction::Success(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result = retry_with_backoff(&fast(3), &token, |_| async { RetryAction::Success(1) }).await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }
}
