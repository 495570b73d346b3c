//! Bounded exponential backoff around single remote calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error};

use super::RemoteError;

/// Retry policy for idempotent remote calls.
///
/// Attempt `n` (0-based) that fails with a retryable error is followed by a
/// sleep of `base_delay * 2^n` plus a uniform random jitter in
/// `[0, max_jitter)`. Terminal errors are returned at once.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per call, the first one included
    pub max_attempts: u32,

    /// Backoff base delay
    pub base_delay: Duration,

    /// Upper bound of the random jitter added to every backoff
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            self.max_jitter.mul_f64(rand::thread_rng().gen::<f64>())
        };
        exponential.saturating_add(jitter)
    }

    /// Run `call` until it succeeds, fails terminally or runs out of attempts.
    ///
    /// `call` builds a fresh request future on every attempt. `operation`
    /// names the call in logs and in [`RemoteError::RetriesExhausted`].
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match call().await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.is_retryable() {
                error!("Failed to {} due to error: {}", operation, err);
                return Err(err);
            }

            if attempt + 1 >= max_attempts {
                let exhausted = RemoteError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: max_attempts,
                };
                error!("{}", exhausted);
                return Err(exhausted);
            }

            let delay = self.backoff_delay(attempt);
            debug!(
                "{}: {}. Trying again in {:.2}s (attempt {}/{})",
                operation,
                err,
                delay.as_secs_f64(),
                attempt + 2,
                max_attempts
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn server_error(status: u16) -> RemoteError {
        RemoteError::Api {
            operation: "test".to_string(),
            status,
            message: "server error".to_string(),
        }
    }

    /// Fails with `status` for the first `failures` calls, then succeeds.
    async fn flaky(calls: &AtomicU32, failures: u32, status: u16) -> Result<&'static str, RemoteError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < failures {
            Err(server_error(status))
        } else {
            Ok("done")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retryable_failures() {
        for failures in 0..4 {
            let calls = AtomicU32::new(0);
            let policy = RetryPolicy::default();

            let result = policy.execute("upload", || flaky(&calls, failures, 503)).await;

            assert_eq!(result.unwrap(), "done");
            assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_five_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result = policy.execute("list files", || flaky(&calls, u32::MAX, 500)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(RemoteError::RetriesExhausted { operation, attempts }) => {
                assert_eq!(operation, "list files");
                assert_eq!(attempts, 5);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result = policy.execute("upload", || flaky(&calls, u32::MAX, 403)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().status(), Some(403));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_exponentially() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };

        let start = Instant::now();
        let _ = policy.execute("upload", || flaky(&calls, u32::MAX, 500)).await;

        // 1 + 2 + 4 + 8 seconds between the five attempts
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[test]
    fn test_backoff_delay_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..4 {
            let delay = policy.backoff_delay(attempt);
            let base = Duration::from_secs(1 << attempt);
            assert!(delay >= base);
            assert!(delay < base + Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_zero_attempts_still_calls_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };

        let result = policy.execute("upload", || flaky(&calls, 0, 500)).await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
