//! Bounded retry with exponential backoff for transient collaborator failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Retry policy: how many extra attempts, and how long to wait between them.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Exponential backoff doubling from `initial_delay`, capped at 30s.
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::exponential(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exp);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Run `op`, retrying while `retryable` accepts the error and budget remains.
    pub async fn retry_if<F, Fut, T, E, P>(&self, operation: &str, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(operation, retries = retry, "succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if retry < self.max_retries && retryable(&e) => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    warn!(
                        operation,
                        retry,
                        max = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_only_retryable_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::exponential(3, Duration::from_millis(1));

        let c = calls.clone();
        let result: Result<u32, String> = policy
            .retry_if(
                "probe",
                || {
                    let c = c.clone();
                    async move {
                        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                        if n < 3 { Err("busy".to_string()) } else { Ok(n) }
                    }
                },
                |e| e == "busy",
            )
            .await;
        assert_eq!(result, Ok(3));

        let c = Arc::new(AtomicU32::new(0));
        let c2 = c.clone();
        let result: Result<u32, String> = policy
            .retry_if(
                "probe",
                || {
                    let c = c2.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("fatal".to_string())
                    }
                },
                |e| e == "busy",
            )
            .await;
        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(c.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), &str> = RetryPolicy::exponential(2, Duration::from_millis(1))
            .retry_if(
                "place",
                || {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err("busy")
                    }
                },
                |_| true,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
