//! Retry-with-backoff for transient provider failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use docdex_shared::Result;

/// Maximum random jitter added to each computed backoff.
const JITTER_MS: u64 = 250;

/// Exponential-backoff retry policy for 429/5xx provider responses and
/// transport failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
        }
    }

    /// Run `op`, retrying retryable errors up to `max_retries` times.
    ///
    /// A provider-supplied `Retry-After` takes precedence over the computed
    /// backoff `initial · 2^attempt + jitter(0..250ms)`.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = e
                        .retry_after()
                        .unwrap_or_else(|| self.backoff_for(attempt));
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient provider error, retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MS));
        exp + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    use docdex_shared::DocdexError;

    fn provider_err(status: u16, retry_after: Option<Duration>) -> DocdexError {
        DocdexError::Provider {
            status,
            retry_after,
            message: "boom".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result: i32 = policy
            .run(move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(provider_err(503, None))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn respects_retry_after() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let calls_in = calls.clone();
        policy
            .run(move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(provider_err(429, Some(Duration::from_secs(7))))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        // Exactly the Retry-After delay: no computed backoff, no jitter.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_between_attempts() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let calls_in = calls.clone();
        let result = policy
            .run(move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(provider_err(500, None))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3, "initial try + 2 retries");

        // 100ms + 200ms plus up to 250ms jitter per wait.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300 + 2 * JITTER_MS), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_propagate_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_secs(10));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let calls_in = calls.clone();
        let result = policy
            .run(move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(provider_err(400, None))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
