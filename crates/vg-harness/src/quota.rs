use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Returned when an ingest key (or fallback IP) has exhausted its quota.
///
/// `retry_after` is the wait until the tighter of the two windows admits
/// another request; handlers surface it as a `Retry-After` header.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exhausted for key `{key}`, retry after {retry_after:?}")]
    Exhausted {
        key: String,
        retry_after: Duration,
    },
}

impl QuotaError {
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            QuotaError::Exhausted { retry_after, .. } => retry_after.as_secs().max(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QuotaLimits {
    pub per_minute: u64,
    pub per_hour: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            per_minute: 100,
            per_hour: 1000,
        }
    }
}

// ---------------------------------------------------------------------------
// Bucket (per-key state)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Window {
    tokens: f64,
    last_refill: Instant,
}

impl Window {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Refill proportionally to elapsed time, capped at `capacity`, then try
    /// to take one token.
    fn try_take(&mut self, tokens_per_second: f64, capacity: f64) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * tokens_per_second).min(capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - self.tokens) / tokens_per_second))
        }
    }
}

#[derive(Debug, Clone)]
struct KeyState {
    minute: Window,
    hour: Window,
}

// ---------------------------------------------------------------------------
// QuotaController
// ---------------------------------------------------------------------------

/// Two-scale request quota per API-key-hash (or per IP when no key is
/// presented). Both windows must admit the request.
#[derive(Debug)]
pub struct QuotaController {
    limits: QuotaLimits,
    keys: DashMap<String, KeyState>,
}

impl QuotaController {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            keys: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str) -> Result<(), QuotaError> {
        let per_minute = self.limits.per_minute as f64;
        let per_hour = self.limits.per_hour as f64;
        let mut state = self.keys.entry(key.to_string()).or_insert_with(|| KeyState {
            minute: Window::new(per_minute),
            hour: Window::new(per_hour),
        });

        // Check the hour window first so a minute-window rejection does not
        // consume an hour token.
        let hour_wait = match state.hour.try_take(per_hour / 3600.0, per_hour) {
            Ok(()) => None,
            Err(wait) => Some(wait),
        };
        if let Some(wait) = hour_wait {
            warn!(key, retry_after = ?wait, "hourly quota exhausted");
            return Err(QuotaError::Exhausted {
                key: key.to_string(),
                retry_after: wait,
            });
        }

        match state.minute.try_take(per_minute / 60.0, per_minute) {
            Ok(()) => Ok(()),
            Err(wait) => {
                // Return the hour token taken above.
                state.hour.tokens = (state.hour.tokens + 1.0).min(per_hour);
                warn!(key, retry_after = ?wait, "per-minute quota exhausted");
                Err(QuotaError::Exhausted {
                    key: key.to_string(),
                    retry_after: wait,
                })
            }
        }
    }

    /// Approximate tokens left in the minute window; used by tests and the
    /// health endpoint.
    pub fn remaining_minute(&self, key: &str) -> f64 {
        match self.keys.get(key) {
            Some(state) => {
                let elapsed = state.minute.last_refill.elapsed().as_secs_f64();
                let per_minute = self.limits.per_minute as f64;
                (state.minute.tokens + elapsed * per_minute / 60.0).min(per_minute)
            }
            None => self.limits.per_minute as f64,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_minute_limit() {
        let quota = QuotaController::new(QuotaLimits {
            per_minute: 5,
            per_hour: 1000,
        });
        for _ in 0..5 {
            assert!(quota.check("k1").is_ok());
        }
        assert!(quota.check("k1").is_err());
    }

    #[test]
    fn hour_limit_binds_even_with_minute_headroom() {
        let quota = QuotaController::new(QuotaLimits {
            per_minute: 100,
            per_hour: 3,
        });
        for _ in 0..3 {
            assert!(quota.check("k1").is_ok());
        }
        let err = quota.check("k1").unwrap_err();
        assert!(err.retry_after_secs() >= 1);
    }

    #[test]
    fn keys_are_independent() {
        let quota = QuotaController::new(QuotaLimits {
            per_minute: 1,
            per_hour: 1000,
        });
        assert!(quota.check("a").is_ok());
        assert!(quota.check("a").is_err());
        assert!(quota.check("b").is_ok());
    }

    #[test]
    fn minute_rejection_does_not_burn_hour_tokens() {
        let quota = QuotaController::new(QuotaLimits {
            per_minute: 1,
            per_hour: 2,
        });
        assert!(quota.check("k").is_ok());
        // Rejected by the minute window several times...
        for _ in 0..5 {
            assert!(quota.check("k").is_err());
        }
        // ...yet one hour token must remain.
        let state = quota.keys.get("k").unwrap();
        assert!(state.hour.tokens >= 0.9);
    }
}
