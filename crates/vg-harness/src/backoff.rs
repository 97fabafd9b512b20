use std::future::Future;
use std::time::Duration;

use tracing::warn;

// ---------------------------------------------------------------------------
// Outcome classification
// ---------------------------------------------------------------------------

/// How one delivery attempt ended, from the retry loop's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Worth retrying: network fault, timeout, 5xx.
    Transient(String),
    /// Not worth retrying: 4xx, malformed target, unsupported channel.
    Permanent(String),
}

impl AttemptError {
    pub fn message(&self) -> &str {
        match self {
            AttemptError::Transient(m) | AttemptError::Permanent(m) => m,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff: each attempt gets `attempt_timeout`, the
/// whole loop gets `total_budget`, and permanent errors stop immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub total_budget: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            total_budget: Duration::from_secs(60),
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-based; attempt 1 has no delay).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            // 500ms, 1s, 2s, 4s, ... doubling per retry.
            self.base_delay * 2u32.saturating_pow(attempt - 2)
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is
    /// spent. Returns the last error when all attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, AttemptError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let started = tokio::time::Instant::now();
        let mut last_err = AttemptError::Transient("no attempts made".to_string());

        for attempt in 1..=self.max_attempts {
            let delay = self.delay_before(attempt);
            if started.elapsed() + delay > self.total_budget {
                warn!(label, attempt, "retry budget exhausted");
                break;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err @ AttemptError::Permanent(_))) => {
                    warn!(label, attempt, error = err.message(), "permanent failure");
                    return Err(err);
                }
                Ok(Err(err)) => {
                    warn!(label, attempt, error = err.message(), "attempt failed");
                    last_err = err;
                }
                Err(_) => {
                    warn!(label, attempt, timeout = ?self.attempt_timeout, "attempt timed out");
                    last_err = AttemptError::Transient(format!(
                        "timed out after {:?}",
                        self.attempt_timeout
                    ));
                }
            }
        }
        Err(last_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_first_try() {
        let policy = RetryPolicy::default();
        let result: Result<i32, _> = policy.run("test", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = policy
            .run("test", move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AttemptError::Transient("flaky".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), _> = policy
            .run("test", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::Permanent("bad target".into()))
                }
            })
            .await;
        assert!(matches!(result, Err(AttemptError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_and_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let result: Result<(), _> = policy
            .run("test", || async { Err(AttemptError::Transient("down".into())) })
            .await;
        match result {
            Err(AttemptError::Transient(msg)) => assert_eq!(msg, "down"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(500));
        assert_eq!(policy.delay_before(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_before(4), Duration::from_millis(2000));
    }
}
