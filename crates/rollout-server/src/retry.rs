//! Bounded exponential backoff for transient I/O.

use crate::error::{ServerError, ServerResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy doubling from `base_delay`, capped at 30 seconds
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self { attempts: attempts.max(1), base_delay, max_delay: Duration::from_secs(30) }
    }

    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100))
    }
}

/// Run `op` until it succeeds, fails permanently, or the attempts run out.
///
/// Only errors for which [`ServerError::is_transient`] holds are retried.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> ServerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServerResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay_after(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Like [`with_retry`], but names the operation in the final error
pub async fn with_retry_context<T, F, Fut>(policy: RetryPolicy, operation: &str, op: F) -> ServerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServerResult<T>>,
{
    with_retry(policy, operation, op).await.map_err(|e| match e {
        ServerError::LogError(msg) => ServerError::LogError(format!("{}: {}", operation, msg)),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy { attempts: 10, base_delay: Duration::from_millis(100), max_delay: Duration::from_millis(500) };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(RetryPolicy::new(3, Duration::from_millis(1)), "append", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ServerError::LogError("broker unavailable".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: ServerResult<()> = with_retry_context(RetryPolicy::new(2, Duration::from_millis(1)), "append", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ServerError::LogError("down".into())) }
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("append: down"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: ServerResult<()> = with_retry(RetryPolicy::default(), "load", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ServerError::ConfigError("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
