//! Per-key backoff sources consulted on rate-limited enqueues.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Per-key source of enqueue delays.
///
/// `when` returns the delay to apply before the key's next run; repeated
/// calls without an intervening `forget` return growing delays. `forget`
/// clears the key's history so it backs off from scratch.
pub trait RateLimiter: Send + Sync + 'static {
    /// Delay to apply before the next run of `key`.
    fn when(&self, key: &str) -> Duration;

    /// Reset backoff state for `key`.
    fn forget(&self, key: &str);

    /// Number of times `key` has been charged since it was last forgotten.
    fn requeues(&self, key: &str) -> u32;
}

/// Exponential per-key backoff: the n-th charge for a key yields
/// `base * 2^n`, capped at `max`.
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    charges: Mutex<HashMap<String, u32>>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            charges: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ExponentialBackoff {
    /// 5ms initial delay, capped at 1000 seconds.
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl RateLimiter for ExponentialBackoff {
    fn when(&self, key: &str) -> Duration {
        let mut charges = self.charges.lock().unwrap();
        let count = charges.entry(key.to_string()).or_insert(0);
        let exponent = *count;
        *count += 1;
        // Past 2^64 the doubling is far beyond any sane cap; clamping the
        // exponent keeps the f64 math finite.
        let backoff = self.base.as_secs_f64() * 2f64.powi(exponent.min(64) as i32);
        Duration::from_secs_f64(backoff.min(self.max.as_secs_f64()))
    }

    fn forget(&self, key: &str) {
        self.charges.lock().unwrap().remove(key);
    }

    fn requeues(&self, key: &str) -> u32 {
        *self.charges.lock().unwrap().get(key).unwrap_or(&0)
    }
}

/// Rate limiter that never delays and keeps no state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRateLimit;

impl RateLimiter for NoRateLimit {
    fn when(&self, _key: &str) -> Duration {
        Duration::ZERO
    }

    fn forget(&self, _key: &str) {}

    fn requeues(&self, _key: &str) -> u32 {
        0
    }
}
